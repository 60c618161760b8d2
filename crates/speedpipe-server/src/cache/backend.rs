//! Store backends for the latest-value slot: in-process (DashMap) or Redis.

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::CacheError;

/// A locally stored value with optional expiry.
#[derive(Clone, Debug)]
pub struct StoredEntry {
    pub data: Vec<u8>,
    pub stored_at: Instant,
    pub ttl: Option<Duration>,
}

impl StoredEntry {
    pub fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.stored_at.elapsed() > ttl)
    }
}

/// Key-value store behind the latest-value cache.
///
/// ## Modes
///
/// - **Local**: single-instance, values live in a DashMap
/// - **Redis**: values live in Redis and are shared by every instance
///
/// Unlike a read-through cache, a Redis failure is reported to the caller
/// and never turned into a miss: "no value yet" and "store unavailable"
/// must stay distinguishable.
#[derive(Clone)]
pub enum StoreBackend {
    /// Single-instance: local DashMap only
    Local(Arc<DashMap<String, StoredEntry>>),

    /// Shared: Redis through a connection pool
    Redis(Pool),
}

impl StoreBackend {
    /// Create a new local-only store.
    pub fn new_local() -> Self {
        StoreBackend::Local(Arc::new(DashMap::new()))
    }

    /// Create a new Redis-backed store.
    pub fn new_redis(redis_pool: Pool) -> Self {
        StoreBackend::Redis(redis_pool)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Local(_) => "local",
            StoreBackend::Redis(_) => "redis",
        }
    }

    /// Get the raw bytes stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self {
            StoreBackend::Local(map) => {
                let result = match map.get(key) {
                    Some(entry) if entry.is_expired() => {
                        drop(entry);
                        map.remove(key);
                        None
                    }
                    Some(entry) => Some(entry.data.clone()),
                    None => None,
                };
                tracing::debug!(key = %key, hit = result.is_some(), "store get (local)");
                Ok(result)
            }
            StoreBackend::Redis(redis) => {
                let mut conn = redis.get().await.map_err(|e| {
                    tracing::warn!(error = %e, "Failed to get Redis connection");
                    CacheError::store(e)
                })?;
                let data = conn.get::<_, Option<Vec<u8>>>(key).await.map_err(|e| {
                    tracing::warn!(key = %key, error = %e, "Redis GET error");
                    CacheError::store(e)
                })?;
                tracing::debug!(key = %key, hit = data.is_some(), "store get (redis)");
                Ok(data)
            }
        }
    }

    /// Store `value` under `key`, replacing whatever was there.
    ///
    /// The write is awaited; callers learn about failures.
    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        match self {
            StoreBackend::Local(map) => {
                map.insert(key.to_string(), StoredEntry::new(value, ttl));
                Ok(())
            }
            StoreBackend::Redis(redis) => {
                let mut conn = redis.get().await.map_err(|e| {
                    tracing::warn!(error = %e, "Failed to get Redis connection");
                    CacheError::store(e)
                })?;
                let result = match ttl {
                    Some(ttl) => {
                        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                            .await
                    }
                    None => conn.set::<_, _, ()>(key, value).await,
                };
                result.map_err(|e| {
                    tracing::warn!(key = %key, error = %e, "Redis SET error");
                    CacheError::store(e)
                })?;
                tracing::debug!(key = %key, ttl_secs = ?ttl.map(|t| t.as_secs()), "store set (redis)");
                Ok(())
            }
        }
    }

    /// Check that the store answers.
    pub async fn ping(&self) -> Result<(), CacheError> {
        match self {
            StoreBackend::Local(_) => Ok(()),
            StoreBackend::Redis(redis) => {
                let mut conn = redis.get().await.map_err(CacheError::store)?;
                let _: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(CacheError::store)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_set_overwrites_and_get_returns_latest() {
        let store = StoreBackend::new_local();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", b"one".to_vec(), None).await.unwrap();
        store.set("k", b"two".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"two".to_vec()));
        assert!(store.ping().await.is_ok());
        assert_eq!(store.kind(), "local");
    }

    #[tokio::test]
    async fn local_entries_expire() {
        let store = StoreBackend::new_local();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[test]
    fn entries_without_ttl_never_expire() {
        let entry = StoredEntry::new(vec![1], None);
        assert!(!entry.is_expired());
    }
}
