//! Redis cache provider implementation.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use ticketq_core::error::{AppError, ErrorKind};
use ticketq_core::result::AppResult;
use ticketq_core::traits::CacheProvider;

use super::client::RedisClient;

/// Redis-backed cache provider.
///
/// Tier 2 durability comes from Redis's own persistence; [`snapshot`]
/// asks the server for a background save.
///
/// [`snapshot`]: CacheProvider::snapshot
#[derive(Debug, Clone)]
pub struct RedisCacheProvider {
    client: RedisClient,
}

impl RedisCacheProvider {
    /// Wrap a connected client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Cache, format!("Redis error: {e}"), e)
    }
}

/// Redis rejects `EX 0`, so sub-second TTLs round up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheProvider for RedisCacheProvider {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let full_key = self.client.prefixed_key(key);
        let mut conn = self.client.conn_mut();
        let result: Option<String> = conn.get(&full_key).await.map_err(Self::map_err)?;
        Ok(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let full_key = self.client.prefixed_key(key);
        let mut conn = self.client.conn_mut();
        let _: () = conn
            .set_ex(&full_key, value, ttl_secs(ttl))
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let full_key = self.client.prefixed_key(key);
        let mut conn = self.client.conn_mut();
        let _: () = conn.del(&full_key).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn snapshot(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let reply: Result<String, redis::RedisError> =
            redis::cmd("BGSAVE").query_async(&mut conn).await;

        match reply {
            Ok(status) => {
                debug!(status = %status, "Requested Redis background save");
                Ok(true)
            }
            // A save already running covers this request.
            Err(e) if e.to_string().contains("already in progress") => {
                warn!(error = %e, "Redis background save already running");
                Ok(true)
            }
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(pong == "PONG")
    }
}
