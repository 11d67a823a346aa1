//! Rate limiting logic and key derivation.

mod limiter;
mod scope;

pub use limiter::{LimiterSettings, RateLimiter, DEFAULT_LOCK_TIMEOUT, MAX_DURATION};
pub use scope::{Scope, MARKER_SUFFIX_LEN};
