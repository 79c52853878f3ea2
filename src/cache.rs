//! Shared key-value cache with TTL support and atomic increments.
//!
//! The [`KvStore`] trait is the seam to an external cache; [`MemoryKvStore`]
//! is the in-process implementation used by the service and the tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors raised by a [`KvStore`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// A stored value did not have the expected shape.
    #[error("cache value for {key} is not {expected}")]
    WrongType { key: String, expected: &'static str },

    /// JSON (de)serialization of a cached value failed.
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Atomically add `delta` and return the new value. `ttl` only applies when
    /// the key is created by this call.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>)
    -> Result<i64, CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), CacheError> {
    store.set(key, serde_json::to_string(value)?, ttl).await
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process [`KvStore`] with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut guard) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = guard.len();
        guard.retain(|_, entry| entry.is_live(now));
        before - guard.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut guard = self.lock()?;
        let now = Instant::now();
        match guard.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.lock()?
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CacheError> {
        let mut guard = self.lock()?;
        let now = Instant::now();

        let current = match guard.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry),
            _ => None,
        };

        let (next, expires_at) = match current {
            Some(entry) => {
                let value = entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| CacheError::WrongType {
                        key: key.to_string(),
                        expected: "an integer",
                    })?;
                (value + delta, entry.expires_at)
            }
            None => (delta, ttl.map(|ttl| now + ttl)),
        };

        guard.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryKvStore::new();
        store.set("a", "1".to_string(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryKvStore::new();
        store
            .set("short", "x".to_string(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("short").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_by_creates_and_accumulates() {
        let store = MemoryKvStore::new();
        assert_eq!(store.incr_by("n", 1, None).await.unwrap(), 1);
        assert_eq!(store.incr_by("n", 5, None).await.unwrap(), 6);
        assert_eq!(store.incr_by("n", -2, None).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_incr_by_rejects_non_integer() {
        let store = MemoryKvStore::new();
        store.set("s", "abc".to_string(), None).await.unwrap();
        assert!(matches!(
            store.incr_by("s", 1, None).await,
            Err(CacheError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_keys_by_prefix_and_purge() {
        let store = MemoryKvStore::new();
        store.set("search:a", "1".into(), None).await.unwrap();
        store.set("search:b", "2".into(), None).await.unwrap();
        store.set("other", "3".into(), None).await.unwrap();
        store
            .set("search:gone", "4".into(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut keys = store.keys("search:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["search:a".to_string(), "search:b".to_string()]);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryKvStore::new();
        set_json(&store, "v", &vec![1, 2, 3], None).await.unwrap();
        let back: Option<Vec<i32>> = get_json(&store, "v").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
