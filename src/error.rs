//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Lock contention is deliberately absent: a `log` call that cannot take the
/// scope lock in time is reported as a refusal, not as an error.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors, including rejected limiter settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures reported by a store backend
    #[error("Store error: {0}")]
    Store(String),

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TollgateError {
    fn from(err: ::config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
