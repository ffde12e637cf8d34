//! Cache manager that dispatches to the configured provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use ticketq_core::config::CacheConfig;
use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_core::traits::CacheProvider;

/// Cheaply cloneable handle to the configured fast cache.
#[derive(Debug, Clone)]
pub struct CacheManager {
    /// The inner cache provider.
    inner: Arc<dyn CacheProvider>,
}

impl CacheManager {
    /// Create a new cache manager from configuration.
    pub async fn new(config: &CacheConfig) -> AppResult<Self> {
        let inner: Arc<dyn CacheProvider> = match config.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!("Initializing Redis cache provider");
                let client = crate::redis::RedisClient::connect(&config.redis).await?;
                Arc::new(crate::redis::RedisCacheProvider::new(client))
            }
            #[cfg(feature = "memory")]
            "memory" => {
                info!("Initializing in-memory cache provider");
                Arc::new(crate::memory::MemoryCacheProvider::new(&config.memory))
            }
            other => {
                return Err(AppError::configuration(format!(
                    "Unknown cache provider: '{other}'. Supported: memory, redis"
                )));
            }
        };

        Ok(Self { inner })
    }

    /// Create a cache manager from an existing provider (for testing).
    pub fn from_provider(provider: Arc<dyn CacheProvider>) -> Self {
        Self { inner: provider }
    }
}

#[async_trait]
impl CacheProvider for CacheManager {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.inner.delete(key).await
    }

    async fn snapshot(&self) -> AppResult<bool> {
        self.inner.snapshot().await
    }

    async fn health_check(&self) -> AppResult<bool> {
        self.inner.health_check().await
    }
}
