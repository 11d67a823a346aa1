//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterSettings;

/// Prefix for environment overrides, e.g. `TOLLGATE__STORE__REDIS_URL`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Default limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Circuit breakers, one per protected resource
    #[serde(default)]
    pub breakers: Vec<BreakerSettings>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Lifetime of a lock entry, bounding how long a crashed holder blocks a scope
    #[serde(default = "default_lock_lease")]
    pub lock_lease_ms: u64,

    /// Delay between lock acquisition attempts
    #[serde(default = "default_lock_retry_interval")]
    pub lock_retry_interval_ms: u64,

    /// `COUNT` hint for each `SCAN` round trip
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            lock_lease_ms: default_lock_lease(),
            lock_retry_interval_ms: default_lock_retry_interval(),
            scan_count: default_scan_count(),
        }
    }
}

impl StoreConfig {
    /// Lock lease as a duration.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// Lock retry interval as a duration.
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    /// Reject store settings that would break lock serialization or scanning.
    ///
    /// The lease must outlive at least one retry interval, otherwise a held
    /// lock can expire before a contender even looks at it again.
    pub fn validate(&self) -> Result<()> {
        if self.lock_lease_ms == 0 {
            return Err(TollgateError::Config(
                "store.lock_lease_ms must be positive".to_string(),
            ));
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(TollgateError::Config(
                "store.lock_retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.scan_count == 0 {
            return Err(TollgateError::Config(
                "store.scan_count must be positive".to_string(),
            ));
        }
        if self.lock_lease_ms <= self.lock_retry_interval_ms {
            return Err(TollgateError::Config(format!(
                "store.lock_lease_ms ({}) must exceed store.lock_retry_interval_ms ({})",
                self.lock_lease_ms, self.lock_retry_interval_ms
            )));
        }
        Ok(())
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_lock_lease() -> u64 {
    1000
}

fn default_lock_retry_interval() -> u64 {
    5
}

fn default_scan_count() -> usize {
    100
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per window
    #[serde(default = "default_number_of_requests")]
    pub number_of_requests: u64,

    /// Window length in milliseconds
    #[serde(default = "default_time_bound")]
    pub time_bound_ms: u64,

    /// Lock acquisition timeout in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Value stored in each marker
    #[serde(default)]
    pub log_value: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            number_of_requests: default_number_of_requests(),
            time_bound_ms: default_time_bound(),
            lock_timeout_ms: default_lock_timeout(),
            log_value: String::new(),
        }
    }
}

impl LimiterConfig {
    /// Convert into limiter settings.
    pub fn to_settings(&self) -> LimiterSettings {
        LimiterSettings::new(
            self.number_of_requests,
            Duration::from_millis(self.time_bound_ms),
        )
        .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
        .with_log_value(self.log_value.clone())
    }
}

fn default_number_of_requests() -> u64 {
    5
}

fn default_time_bound() -> u64 {
    60_000
}

fn default_lock_timeout() -> u64 {
    100
}

/// Settings for a single circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// The protected resource
    pub resource_id: String,

    /// Events tolerated per window before the breaker opens
    pub number_of_requests: u64,

    /// Window length in milliseconds
    #[serde(default = "default_time_bound")]
    pub time_bound_ms: u64,
}

impl BreakerSettings {
    /// Window length as a duration.
    pub fn time_bound(&self) -> Duration {
        Duration::from_millis(self.time_bound_ms)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// Environment variables use the `TOLLGATE` prefix and `__` as the
    /// nesting separator, so `TOLLGATE__LIMITER__NUMBER_OF_REQUESTS=10`
    /// overrides `limiter.number_of_requests`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Self>()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the store, the default limiter and every breaker.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.limiter.to_settings().validate()?;
        for breaker in &self.breakers {
            LimiterSettings::new(breaker.number_of_requests, breaker.time_bound())
                .validate()
                .map_err(|e| {
                    TollgateError::Config(format!("breaker {}: {}", breaker.resource_id, e))
                })?;
        }
        Ok(())
    }

    /// Look up the breaker configured for `resource_id`.
    pub fn breaker(&self, resource_id: &str) -> Option<&BreakerSettings> {
        self.breakers.iter().find(|b| b.resource_id == resource_id)
    }
}
