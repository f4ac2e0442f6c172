//! Core rate limiter implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::Bucket;
use super::clock::{Clock, MonotonicClock};
use crate::config::LimiterSettings;
use crate::error::Result;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Requests left in the key's current window
    pub remaining: u64,
    /// Time until the key's window rolls over; zero when admitted
    pub retry_after: Duration,
}

/// A fixed-window rate limiter over a bounded set of keys.
///
/// This struct is thread-safe and is meant to be shared behind an `Arc`,
/// one instance per protected endpoint family.
pub struct RateLimiter {
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    table: Mutex<BucketTable>,
    /// Mirror of the table size, readable without taking the lock
    bucket_count: AtomicUsize,
}

/// Buckets plus their access order, oldest first.
#[derive(Default)]
struct BucketTable {
    buckets: HashMap<String, Bucket>,
    access_order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl BucketTable {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Remove buckets idle for a full window, stopping at the first live one.
    fn expire(&mut self, now: u64, window_ms: u64) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.access_order.first_entry() {
            let idle = self
                .buckets
                .get(entry.get())
                .map_or(true, |bucket| bucket.is_idle(now, window_ms));
            if !idle {
                break;
            }
            let key = entry.remove();
            self.buckets.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Evict least-recently-used buckets until at most `max_buckets` remain.
    /// The bucket for `exempt` is never chosen.
    fn evict(&mut self, max_buckets: usize, exempt: &str) -> usize {
        let mut evicted = 0;
        while self.buckets.len() > max_buckets {
            let oldest = self
                .access_order
                .iter()
                .find(|(_, key)| key.as_str() != exempt)
                .map(|(seq, _)| *seq);

            let Some(seq) = oldest else { break };
            if let Some(key) = self.access_order.remove(&seq) {
                debug!(key = %key, "Evicting least recently used bucket");
                self.buckets.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.buckets.remove(key) {
            Some(bucket) => {
                self.access_order.remove(&bucket.seq());
                true
            }
            None => false,
        }
    }
}

impl RateLimiter {
    /// Create a rate limiter on the monotonic clock.
    ///
    /// Fails if any parameter is zero.
    pub fn new(capacity: u64, window_ms: u64, max_buckets: usize) -> Result<Self> {
        Self::from_settings(LimiterSettings::new(capacity, window_ms, max_buckets)?)
    }

    /// Create a rate limiter from validated settings.
    pub fn from_settings(settings: LimiterSettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(MonotonicClock::new()))
    }

    /// Create a rate limiter reading time from `clock`.
    pub fn with_clock(settings: LimiterSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            table: Mutex::new(BucketTable::default()),
            bucket_count: AtomicUsize::new(0),
        })
    }

    /// Record a request for `key` and report whether it is admitted.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).admitted
    }

    /// Record a request for `key` and return the full decision.
    ///
    /// Expired buckets are reclaimed and the bucket cap is enforced before
    /// this returns.
    pub fn check(&self, key: &str) -> Decision {
        let LimiterSettings {
            capacity,
            window_ms,
            max_buckets,
        } = self.settings;

        let mut guard = self.table.lock();
        let table = &mut *guard;
        let now = self.clock.now_millis();
        let seq = table.next_seq();

        let (admitted, count, until_reset) = match table.buckets.get_mut(key) {
            Some(bucket) => {
                let previous = bucket.seq();
                let admitted = bucket.hit(now, window_ms, capacity, seq);
                if let Some(owned) = table.access_order.remove(&previous) {
                    table.access_order.insert(seq, owned);
                }
                (
                    admitted,
                    bucket.count(),
                    bucket.duration_until_reset(now, window_ms),
                )
            }
            None => {
                debug!(key = %key, capacity, window_ms, "Creating new bucket");
                let bucket = Bucket::new(now, seq);
                let until_reset = bucket.duration_until_reset(now, window_ms);
                table.buckets.insert(key.to_string(), bucket);
                table.access_order.insert(seq, key.to_string());
                (1 <= capacity, 1, until_reset)
            }
        };

        let expired = table.expire(now, window_ms);
        let evicted = table.evict(max_buckets, key);
        self.bucket_count
            .store(table.buckets.len(), Ordering::Release);
        drop(guard);

        trace!(
            key = %key,
            count,
            admitted,
            expired,
            evicted,
            "Checked rate limit"
        );

        if !admitted {
            debug!(key = %key, count, "Rate limit exceeded");
        }

        Decision {
            admitted,
            remaining: capacity.saturating_sub(count),
            retry_after: if admitted { Duration::ZERO } else { until_reset },
        }
    }

    /// Number of tracked keys. May be stale under concurrent use.
    pub fn approximate_bucket_count(&self) -> usize {
        self.bucket_count.load(Ordering::Acquire)
    }

    /// Count in the key's current window.
    ///
    /// Returns `None` if the key is not tracked or its window has elapsed.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let table = self.table.lock();
        table
            .buckets
            .get(key)
            .filter(|bucket| !bucket.window_elapsed(now, self.settings.window_ms))
            .map(Bucket::count)
    }

    /// Forget a key, returning whether it was tracked.
    pub fn reset(&self, key: &str) -> bool {
        let mut table = self.table.lock();
        let removed = table.remove(key);
        self.bucket_count
            .store(table.buckets.len(), Ordering::Release);
        if removed {
            debug!(key = %key, "Bucket reset");
        }
        removed
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.buckets.clear();
        table.access_order.clear();
        self.bucket_count.store(0, Ordering::Release);
    }

    /// Reclaim idle buckets without recording a request.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let mut table = self.table.lock();
        let now = self.clock.now_millis();
        let removed = table.expire(now, self.settings.window_ms);
        self.bucket_count
            .store(table.buckets.len(), Ordering::Release);
        removed
    }

    /// The limiter's parameters.
    pub fn settings(&self) -> LimiterSettings {
        self.settings
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .field("buckets", &self.approximate_bucket_count())
            .finish()
    }
}
