//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limiter;
mod registry;
mod sweeper;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use limiter::{Decision, RateLimiter};
pub use registry::LimiterRegistry;
pub use sweeper::spawn_sweeper;
