//! Periodic expiry sweeps.
//!
//! Every `allow` call already reclaims expired buckets. The sweeper only
//! shortens how long idle keys linger on limiters that see little traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::limiter::RateLimiter;

/// Spawn a task that sweeps every limiter once per `interval`.
///
/// The task exits once `shutdown` reads `true` or its sender is dropped.
pub fn spawn_sweeper(
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            limiters = limiters.len(),
            interval_ms = interval.as_millis() as u64,
            "Starting bucket sweeper"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed: usize = limiters.iter().map(|limiter| limiter.sweep()).sum();
                    if removed > 0 {
                        debug!(removed, "Swept idle buckets");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Bucket sweeper stopped");
    })
}
