//! Tollgate - Distributed Rate Limiting
//!
//! This crate implements a rate limiter whose entire state lives in a shared
//! key-value store. Every accepted request leaves a marker entry that expires
//! on its own after the configured window, so any number of processes pointed
//! at the same store agree on how many requests a scope has made recently.
//! A [`CircuitBreaker`] reuses the limiter to gate a single protected resource.

pub mod breaker;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use breaker::CircuitBreaker;
pub use error::{Result, TollgateError};
pub use ratelimit::{LimiterSettings, RateLimiter, Scope};
pub use store::{InMemoryStore, KeyPattern, KeyValueStore, LockGuard};

#[cfg(feature = "redis")]
pub use store::RedisStore;
