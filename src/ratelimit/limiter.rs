//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, trace, warn};

use super::scope::{Scope, MARKER_SUFFIX_LEN};
use crate::error::{Result, TollgateError};
use crate::store::KeyValueStore;

/// Default bound on waiting for a scope lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest window or lock timeout accepted; stores express expiry as a
/// signed 64-bit millisecond count.
pub const MAX_DURATION: Duration = Duration::from_millis(i64::MAX as u64);

const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Settings for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSettings {
    /// Requests allowed per window
    pub number_of_requests: u64,
    /// Window length; also the lifetime of each marker
    pub time_bound: Duration,
    /// How long `log` waits for the scope lock before refusing
    pub lock_timeout: Duration,
    /// Value stored in each marker
    pub log_value: String,
}

impl LimiterSettings {
    /// Create settings with the default lock timeout and an empty log value.
    pub fn new(number_of_requests: u64, time_bound: Duration) -> Self {
        Self {
            number_of_requests,
            time_bound,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            log_value: String::new(),
        }
    }

    /// Override the lock timeout.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Override the value written to each marker.
    pub fn with_log_value(mut self, log_value: impl Into<String>) -> Self {
        self.log_value = log_value.into();
        self
    }

    /// Reject settings that could never admit sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_requests == 0 {
            return Err(TollgateError::Config(
                "number_of_requests must be positive".to_string(),
            ));
        }
        if self.time_bound.is_zero() {
            return Err(TollgateError::Config(
                "time_bound must be positive".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(TollgateError::Config(
                "lock_timeout must be positive".to_string(),
            ));
        }
        if self.time_bound > MAX_DURATION || self.lock_timeout > MAX_DURATION {
            return Err(TollgateError::Config(format!(
                "time_bound and lock_timeout must not exceed {}ms",
                MAX_DURATION.as_millis()
            )));
        }
        Ok(())
    }
}

/// A rate limiter whose state lives entirely in a shared store.
///
/// Each accepted request writes one marker that expires after `time_bound`;
/// the number of live markers for a scope is its recent request count. Any
/// number of limiters, in any number of processes, can share one store.
///
/// Admission is inclusive: a scope is allowed while its count is
/// `<= number_of_requests`, and the check runs before the new marker is
/// written, so `number_of_requests + 1` calls to [`RateLimiter::log`] succeed
/// in a single window.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    settings: LimiterSettings,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter over `store`.
    ///
    /// Fails with [`TollgateError::Config`] if the settings are invalid.
    pub fn new(store: Arc<dyn KeyValueStore>, settings: LimiterSettings) -> Result<Self> {
        settings.validate()?;
        debug!(
            number_of_requests = settings.number_of_requests,
            time_bound_ms = settings.time_bound.as_millis() as u64,
            lock_timeout_ms = settings.lock_timeout.as_millis() as u64,
            "Creating rate limiter"
        );
        Ok(Self { store, settings })
    }

    /// The limiter settings.
    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Record a request for `scope` if it is within budget.
    ///
    /// Returns `Ok(true)` if the request was admitted and recorded and
    /// `Ok(false)` if the scope is over budget or its lock could not be taken
    /// within `lock_timeout`. Store failures are returned as errors.
    #[instrument(skip(self, scope), fields(scope = %scope))]
    pub async fn log(&self, scope: &Scope) -> Result<bool> {
        let lock_name = scope.lock_name();
        let Some(lock) = self
            .store
            .acquire_lock(&lock_name, self.settings.lock_timeout)
            .await?
        else {
            warn!(
                lock = %lock_name,
                timeout_ms = self.settings.lock_timeout.as_millis() as u64,
                "Timed out acquiring scope lock, refusing request"
            );
            return Ok(false);
        };

        let outcome = self.record_if_allowed(scope).await;

        if let Err(e) = lock.release().await {
            warn!(lock = %lock_name, error = %e, "Failed to release scope lock");
        }

        outcome
    }

    async fn record_if_allowed(&self, scope: &Scope) -> Result<bool> {
        if !self.is_allowed(scope).await? {
            debug!(
                limit = self.settings.number_of_requests,
                "Rate limit exceeded"
            );
            return Ok(false);
        }

        let marker = scope.marker_name(&random_suffix());
        self.store
            .set_with_expiry(&marker, &self.settings.log_value, self.settings.time_bound)
            .await?;

        debug!(marker = %marker, "Request admitted");
        Ok(true)
    }

    /// Whether `scope` is currently within budget. Records nothing.
    pub async fn is_allowed(&self, scope: &Scope) -> Result<bool> {
        let count = self.count_logs(scope).await?;
        Ok(count <= self.settings.number_of_requests)
    }

    /// Count the live markers for `scope`.
    ///
    /// Not serialized against `log`, so concurrent writes or expiries may or
    /// may not be reflected.
    pub async fn count_logs(&self, scope: &Scope) -> Result<u64> {
        let pattern = scope.log_pattern();
        let keys = self.store.keys_matching(&pattern).await?;
        let count = keys.iter().filter(|key| scope.owns_marker(key)).count() as u64;

        trace!(scope = %scope, pattern = %pattern, count = count, "Counted markers");
        Ok(count)
    }

    /// Delete every marker for `scope`, resetting its budget.
    #[instrument(skip(self, scope), fields(scope = %scope))]
    pub async fn flush_logs(&self, scope: &Scope) -> Result<()> {
        let keys: Vec<String> = self
            .store
            .keys_matching(&scope.log_pattern())
            .await?
            .into_iter()
            .filter(|key| scope.owns_marker(key))
            .collect();

        let removed = self.store.delete(&keys).await?;
        debug!(removed = removed, "Flushed markers");
        Ok(())
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..MARKER_SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
