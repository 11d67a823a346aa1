//! Shared key-value store abstraction.
//!
//! The limiter never talks to a concrete backend. It consumes the four
//! primitives of [`KeyValueStore`], which lets the same algorithm run against
//! Redis in production and an in-memory store in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// A key pattern matching every key that starts with `prefix`.
///
/// This is the only shape of glob the limiter needs (`"{prefix}*"`), so it is
/// kept structured instead of passing raw glob strings around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    prefix: String,
}

impl KeyPattern {
    /// Create a pattern matching keys beginning with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The literal prefix.
    pub fn as_prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `key` matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    /// Render as a glob with metacharacters in the prefix escaped.
    pub fn to_glob(&self) -> String {
        let mut glob = String::with_capacity(self.prefix.len() + 1);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                glob.push('\\');
            }
            glob.push(c);
        }
        glob.push('*');
        glob
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.prefix)
    }
}

/// Backend-specific release of a held lock.
#[async_trait]
pub trait LockHandle: Send {
    /// Release the lock.
    async fn release(self: Box<Self>) -> Result<()>;
}

/// A held named lock.
///
/// Call [`LockGuard::release`] when the critical section ends. Dropping the
/// guard without releasing never leaves a scope locked forever: in-memory
/// locks are freed on drop and Redis locks expire after their lease.
pub struct LockGuard {
    name: String,
    handle: Box<dyn LockHandle>,
}

impl LockGuard {
    /// Wrap a backend handle for the lock called `name`.
    pub fn new(name: impl Into<String>, handle: Box<dyn LockHandle>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock.
    pub async fn release(self) -> Result<()> {
        self.handle.release().await
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The primitives a shared store must offer.
///
/// Implementations must be safe to share between tasks; the limiter holds them
/// as `Arc<dyn KeyValueStore>`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Create or overwrite `key` so that it expires after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// List live keys matching `pattern`.
    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Wait up to `timeout` for the named lock.
    ///
    /// Returns `Ok(None)` if the timeout elapsed while someone else held it.
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_display() {
        let pattern = KeyPattern::prefix("client-resource-");
        assert_eq!(pattern.to_string(), "client-resource-*");
    }

    #[test]
    fn test_pattern_matches_prefix_only() {
        let pattern = KeyPattern::prefix("r-");
        assert!(pattern.matches("r-abc"));
        assert!(pattern.matches("r-"));
        assert!(!pattern.matches("x-r-abc"));
        assert!(!pattern.matches("r"));
    }

    #[test]
    fn test_glob_escapes_metacharacters() {
        let pattern = KeyPattern::prefix("a*b?[c]\\-");
        assert_eq!(pattern.to_glob(), "a\\*b\\?\\[c\\]\\\\-*");
    }

    #[test]
    fn test_glob_plain_prefix() {
        assert_eq!(KeyPattern::prefix("user-login-").to_glob(), "user-login-*");
    }
}
