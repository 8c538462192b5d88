pub mod rate_limit;
pub mod retry;

pub use rate_limit::{RateLimiter, Throttled};
pub use retry::{RetryPolicy, RetryStrategy};
