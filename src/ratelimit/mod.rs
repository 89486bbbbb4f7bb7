//! Rate limiting policy and key layout.

mod key;
mod limiter;
mod types;

pub use key::{KeySpace, StoreKey};
pub use limiter::{LimiterError, RateLimiter, COUNTER_WINDOW};
pub use types::{Identity, LimitKind, RateLimitConfig, RateLimitStatus};
