//! Per-key window state.

use std::time::Duration;

/// Request count for one key within its current fixed window.
///
/// Buckets carry no synchronization of their own; the owning limiter
/// serializes every mutation under its map lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Requests attempted in the current window, admitted or not
    count: u64,
    /// When the current window began (clock millis)
    window_start: u64,
    /// Most recent hit (clock millis)
    last_access: u64,
    /// Position in the limiter's access order
    seq: u64,
}

impl Bucket {
    /// Create a bucket for a key's first request.
    pub fn new(now: u64, seq: u64) -> Self {
        Self {
            count: 1,
            window_start: now,
            last_access: now,
            seq,
        }
    }

    /// Record a request, rolling the window over first if it has elapsed.
    ///
    /// Returns `true` if the request is within `capacity`.
    pub fn hit(&mut self, now: u64, window_ms: u64, capacity: u64, seq: u64) -> bool {
        if self.window_elapsed(now, window_ms) {
            self.count = 1;
            self.window_start = now;
        } else {
            self.count = self.count.saturating_add(1);
        }
        self.last_access = now;
        self.seq = seq;
        self.count <= capacity
    }

    /// Whether the window that began at `window_start` is over.
    pub fn window_elapsed(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.window_start) >= window_ms
    }

    /// Whether the key has been idle for a full window.
    pub fn is_idle(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.last_access) >= window_ms
    }

    /// Time left until the current window rolls over.
    pub fn duration_until_reset(&self, now: u64, window_ms: u64) -> Duration {
        let elapsed = now.saturating_sub(self.window_start);
        Duration::from_millis(window_ms.saturating_sub(elapsed))
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    #[cfg(test)]
    fn window_start(&self) -> u64 {
        self.window_start
    }

    #[cfg(test)]
    fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_counts_first_request() {
        let bucket = Bucket::new(100, 0);

        assert_eq!(bucket.count(), 1);
        assert_eq!(bucket.window_start(), 100);
        assert_eq!(bucket.last_access(), 100);
    }

    #[test]
    fn test_hit_within_capacity() {
        let mut bucket = Bucket::new(0, 0);

        assert!(bucket.hit(10, 1000, 3, 1));
        assert!(bucket.hit(20, 1000, 3, 2));
        assert_eq!(bucket.count(), 3);
        assert_eq!(bucket.last_access(), 20);
        assert_eq!(bucket.seq(), 2);
    }

    #[test]
    fn test_hit_past_capacity_keeps_counting() {
        let mut bucket = Bucket::new(0, 0);
        bucket.hit(1, 1000, 2, 1);

        // The 3rd and 4th requests are rejected
        assert!(!bucket.hit(2, 1000, 2, 2));
        assert!(!bucket.hit(3, 1000, 2, 3));
        assert_eq!(bucket.count(), 4);
        assert_eq!(bucket.window_start(), 0);
    }

    #[test]
    fn test_hit_after_window_resets() {
        let mut bucket = Bucket::new(0, 0);
        bucket.hit(1, 100, 1, 1);

        assert!(bucket.hit(100, 100, 1, 2));
        assert_eq!(bucket.count(), 1);
        assert_eq!(bucket.window_start(), 100);
    }

    #[test]
    fn test_idle_and_elapsed() {
        let mut bucket = Bucket::new(0, 0);
        bucket.hit(80, 100, 10, 1);

        // Window started at 0, last hit at 80
        assert!(bucket.window_elapsed(100, 100));
        assert!(!bucket.is_idle(100, 100));
        assert!(bucket.is_idle(180, 100));
    }

    #[test]
    fn test_duration_until_reset() {
        let bucket = Bucket::new(1_000, 0);

        assert_eq!(
            bucket.duration_until_reset(1_250, 1_000),
            Duration::from_millis(750)
        );
        assert_eq!(bucket.duration_until_reset(5_000, 1_000), Duration::ZERO);
    }
}
