pub mod breaker;
pub mod limiter;
pub mod retry;

pub use breaker::PairBreakers;
pub use limiter::{AdaptiveRateLimiter, LimiterConfig, LimiterSnapshot};
pub use retry::{with_retry, RetryPolicy};
