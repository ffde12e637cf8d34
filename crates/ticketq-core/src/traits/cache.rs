//! Cache provider trait for pluggable fast-cache backends.

use std::time::Duration;

use async_trait::async_trait;

use crate::result::AppResult;

/// Fast-cache backend (Redis or in-memory).
///
/// Values are JSON strings and every write names its own TTL. Backends own
/// key prefixing. Callers treat the cache as lossy: a miss falls through to
/// the durable store.
#[async_trait]
pub trait CacheProvider: Send + Sync + std::fmt::Debug + 'static {
    /// Get a value by key. Returns `None` if the key does not exist or has expired.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Set a value with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// Delete a key from the cache.
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Get a typed value by deserializing from JSON.
    async fn get_json<T: serde::de::DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> AppResult<Option<T>>
    where
        Self: Sized,
    {
        match self.get(key).await? {
            Some(value) => {
                let parsed = serde_json::from_str(&value)?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// Set a typed value by serializing to JSON.
    async fn set_json<T: serde::Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> AppResult<()>
    where
        Self: Sized,
    {
        let json = serde_json::to_string(value)?;
        self.set(key, &json, ttl).await
    }

    /// Ask the backend to write a point-in-time snapshot of its dataset.
    ///
    /// Returns `false` when the backend has nothing durable to snapshot.
    async fn snapshot(&self) -> AppResult<bool>;

    /// Check that the cache backend is reachable.
    async fn health_check(&self) -> AppResult<bool>;
}
