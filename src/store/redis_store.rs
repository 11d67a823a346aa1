//! Redis-backed store implementation.
//!
//! Markers are plain string keys with a millisecond expiry (`SET .. PX`), so
//! Redis itself trims the trailing edge of every window. Locks follow the
//! usual single-instance recipe: `SET NX PX` with a random token, released by
//! a compare-and-delete script.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, warn};

use super::{KeyPattern, KeyValueStore, LockGuard, LockHandle};
use crate::config::StoreConfig;
use crate::error::Result;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A [`KeyValueStore`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    lock_lease: Duration,
    lock_retry_interval: Duration,
    scan_count: usize,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("lock_lease", &self.lock_lease)
            .field("lock_retry_interval", &self.lock_retry_interval)
            .field("scan_count", &self.scan_count)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using the given store configuration.
    ///
    /// Invalid store settings are rejected before any connection is made.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        info!(url = %config.redis_url, "Connecting to Redis");

        let client = Client::open(config.redis_url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        Self::with_connection(connection, config)
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(connection: ConnectionManager, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connection,
            lock_lease: config.lock_lease(),
            lock_retry_interval: config.lock_retry_interval(),
            scan_count: config.scan_count,
        })
    }
}

/// Milliseconds for a Redis `PX` argument; Redis rejects zero and anything
/// beyond a signed 64-bit millisecond count.
fn as_px(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    millis.clamp(1, i64::MAX as u64)
}

struct RedisLock {
    connection: ConnectionManager,
    name: String,
    token: String,
}

#[async_trait]
impl LockHandle for RedisLock {
    async fn release(self: Box<Self>) -> Result<()> {
        let mut conn = self.connection.clone();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.name)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            warn!(lock = %self.name, "Lock lease expired before release");
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(as_px(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let glob = pattern.to_glob();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await?;

            found.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once across iterations
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>> {
        let mut conn = self.connection.clone();
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(as_px(self.lock_lease))
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                debug!(lock = %name, "Acquired Redis lock");
                let handle = RedisLock {
                    connection: self.connection.clone(),
                    name: name.to_string(),
                    token,
                };
                return Ok(Some(LockGuard::new(name, Box::new(handle))));
            }

            let now = tokio::time::Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return Ok(None),
                Some(deadline) => deadline - now,
                None => self.lock_retry_interval,
            };
            tokio::time::sleep(self.lock_retry_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_px_rounds_up_to_one_millisecond() {
        assert_eq!(as_px(Duration::ZERO), 1);
        assert_eq!(as_px(Duration::from_micros(500)), 1);
        assert_eq!(as_px(Duration::from_millis(250)), 250);
        assert_eq!(as_px(Duration::from_secs(10)), 10_000);
    }

    #[test]
    fn test_px_saturates_huge_durations() {
        assert_eq!(as_px(Duration::MAX), i64::MAX as u64);
    }
}
