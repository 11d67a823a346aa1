//! Circuit breaker built on the rate limiter.
//!
//! The breaker has no open/half-open/closed state machine of its own. It is
//! open whenever the protected resource has logged more events than its
//! budget within the window, recomputed from the store on every call.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::BreakerSettings;
use crate::error::Result;
use crate::ratelimit::{LimiterSettings, RateLimiter, Scope};
use crate::store::KeyValueStore;

/// Gates a single resource behind a global event budget.
#[derive(Debug)]
pub struct CircuitBreaker {
    scope: Scope,
    rate_limiter: RateLimiter,
}

impl CircuitBreaker {
    /// Create a breaker for `resource_id` allowing `number_of_requests`
    /// events per `time_bound`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        resource_id: impl Into<String>,
        number_of_requests: u64,
        time_bound: Duration,
    ) -> Result<Self> {
        let rate_limiter =
            RateLimiter::new(store, LimiterSettings::new(number_of_requests, time_bound))?;

        Ok(Self {
            scope: Scope::global(resource_id),
            rate_limiter,
        })
    }

    /// Create a breaker from configuration.
    pub fn from_settings(store: Arc<dyn KeyValueStore>, settings: &BreakerSettings) -> Result<Self> {
        Self::new(
            store,
            settings.resource_id.clone(),
            settings.number_of_requests,
            settings.time_bound(),
        )
    }

    /// The protected resource.
    pub fn resource_id(&self) -> &str {
        self.scope.resource_id()
    }

    /// Record an event. `false` means the breaker is open and the call
    /// should be refused.
    #[instrument(skip(self), fields(resource = %self.scope))]
    pub async fn log(&self) -> Result<bool> {
        let admitted = self.rate_limiter.log(&self.scope).await?;
        if !admitted {
            debug!("Circuit breaker open");
        }
        Ok(admitted)
    }

    /// Check whether the breaker is closed without recording anything.
    pub async fn short_circuit(&self) -> Result<bool> {
        self.rate_limiter.is_allowed(&self.scope).await
    }

    /// Forget every recorded event, closing the breaker.
    pub async fn reset(&self) -> Result<()> {
        self.rate_limiter.flush_logs(&self.scope).await
    }
}
