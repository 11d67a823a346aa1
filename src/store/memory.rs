//! In-process store implementation.
//!
//! Expiry is measured with `tokio::time::Instant`, so tests running with a
//! paused clock can fast-forward through a window with `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

use super::{KeyPattern, KeyValueStore, LockGuard, LockHandle};
use crate::error::{Result, TollgateError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A [`KeyValueStore`] held entirely in memory.
///
/// Every limiter sharing one `InMemoryStore` (usually through an `Arc`) sees
/// the same markers and locks, which makes it a faithful stand-in for a
/// shared store within a single process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    locks: Arc<LockTable>,
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value of a live key.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lock names currently held or waited on.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, entry| entry.is_live(now));
    }
}

struct MemoryLock {
    name: String,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so the entry survives while contended
        self.locks
            .remove_if(&self.name, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[async_trait]
impl LockHandle for MemoryLock {
    async fn release(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).ok_or_else(|| {
            TollgateError::Store(format!("ttl of {:?} overflows the clock", ttl))
        })?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "Stored key with expiry");
        Ok(())
    }

    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>> {
        let mutex = self.locks.entry(name.to_string()).or_default().clone();

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                let handle = MemoryLock {
                    name: name.to_string(),
                    locks: self.locks.clone(),
                    guard: Some(guard),
                };
                Ok(Some(LockGuard::new(name, Box::new(handle))))
            }
            Err(_) => {
                trace!(lock = %name, "Timed out waiting for lock");
                self.locks
                    .remove_if(name, |_, mutex| Arc::strong_count(mutex) == 1);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_read_back() {
        let store = InMemoryStore::new();
        store
            .set_with_expiry("key", "value", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(store.value("key"), Some("value".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_matching_filters_by_prefix() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);
        store.set_with_expiry("a-1", "", ttl).await.unwrap();
        store.set_with_expiry("a-2", "", ttl).await.unwrap();
        store.set_with_expiry("b-1", "", ttl).await.unwrap();

        let mut keys = store.keys_matching(&KeyPattern::prefix("a-")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a-1".to_string(), "a-2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire_after_ttl() {
        let store = InMemoryStore::new();
        store
            .set_with_expiry("short", "", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_with_expiry("long", "", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let keys = store.keys_matching(&KeyPattern::prefix("")).await.unwrap();
        assert_eq!(keys, vec!["long".to_string()]);
        assert_eq!(store.value("short"), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_counts_removed_keys() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);
        store.set_with_expiry("x", "", ttl).await.unwrap();
        store.set_with_expiry("y", "", ttl).await.unwrap();

        let removed = store
            .delete(&["x".to_string(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.value("x"), None);
        assert_eq!(store.value("y"), Some(String::new()));
    }

    #[tokio::test]
    async fn test_delete_empty_slice() {
        let store = InMemoryStore::new();
        assert_eq!(store.delete(&[]).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_while_held() {
        let store = InMemoryStore::new();
        let timeout = Duration::from_millis(100);

        let held = store.acquire_lock("r-lock", timeout).await.unwrap();
        assert!(held.is_some());

        let contended = store.acquire_lock("r-lock", timeout).await.unwrap();
        assert!(contended.is_none());

        // Other names are independent
        let other = store.acquire_lock("s-lock", timeout).await.unwrap();
        assert!(other.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_available_after_release() {
        let store = InMemoryStore::new();
        let timeout = Duration::from_millis(100);

        let guard = store.acquire_lock("r-lock", timeout).await.unwrap().unwrap();
        assert_eq!(guard.name(), "r-lock");
        guard.release().await.unwrap();

        let again = store.acquire_lock("r-lock", timeout).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_overflowing_ttl_is_an_error() {
        let store = InMemoryStore::new();
        let result = store.set_with_expiry("key", "", Duration::MAX).await;
        assert!(matches!(result, Err(TollgateError::Store(_))));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_table_pruned_after_release() {
        let store = InMemoryStore::new();
        let timeout = Duration::from_millis(100);

        for i in 0..100 {
            let name = format!("client{}-r-lock", i);
            let guard = store.acquire_lock(&name, timeout).await.unwrap().unwrap();
            guard.release().await.unwrap();
        }
        assert_eq!(store.lock_count(), 0);

        {
            let _dropped = store.acquire_lock("r-lock", timeout).await.unwrap();
            assert_eq!(store.lock_count(), 1);
        }
        assert_eq!(store.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_entry_kept_while_contended() {
        let store = Arc::new(InMemoryStore::new());
        let timeout = Duration::from_secs(5);

        let held = store.acquire_lock("r-lock", timeout).await.unwrap().unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let guard = store.acquire_lock("r-lock", timeout).await.unwrap();
                assert!(guard.is_some());
                guard.unwrap().release().await.unwrap();
            })
        };
        // Let the waiter start queueing on the mutex
        tokio::time::sleep(Duration::from_millis(10)).await;

        held.release().await.unwrap();
        waiter.await.unwrap();

        assert_eq!(store.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_available_after_drop() {
        let store = InMemoryStore::new();
        let timeout = Duration::from_millis(100);

        {
            let _guard = store.acquire_lock("r-lock", timeout).await.unwrap();
        }

        let again = store.acquire_lock("r-lock", timeout).await.unwrap();
        assert!(again.is_some());
    }
}
