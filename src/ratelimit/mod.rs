//! Rate limiting logic and state management.

mod counter;
mod descriptor;
mod limiter;
mod rules;
mod store;
mod sweeper;

pub use counter::{
    window_start, CounterRecord, Increment, Thresholds, BURST_WINDOW_SECS,
    DEFAULT_BURST_THRESHOLD_PER_SECOND, DEFAULT_LIMIT_PER_SECOND, DEFAULT_MAX_BURSTS_PER_MINUTE,
};
pub use descriptor::{RateLimitKey, RequestDescriptor};
pub use limiter::{Decision, RateLimiter};
pub use rules::{ApiKeyRule, RouteRule, ThresholdRules};
pub use store::{CounterStore, InMemoryCounterStore};
pub use sweeper::{Clock, ManualClock, Sweeper, SweeperHandle, SystemClock};
