//! In-memory cache implementation using the moka crate.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

use ticketq_core::config::cache::MemoryCacheConfig;
use ticketq_core::result::AppResult;
use ticketq_core::traits::CacheProvider;

/// A cached value together with the TTL it was written with.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

/// Expires each entry after the TTL it was inserted with.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _now: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _now: Instant,
        _current: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Process-local fast cache.
///
/// Nothing survives the process, so [`CacheProvider::snapshot`] is a no-op
/// and Tier 2 jobs kept here share the fate of Tier 3.
#[derive(Debug, Clone)]
pub struct MemoryCacheProvider {
    cache: Cache<String, Entry>,
}

impl MemoryCacheProvider {
    /// Build the cache with its capacity and TTL ceiling.
    pub fn new(config: &MemoryCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.time_to_live_seconds))
            .expire_after(PerEntryTtl)
            .build();

        Self { cache }
    }

    /// Entries currently held, expired ones possibly included until moka evicts them.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheProvider for MemoryCacheProvider {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.cache.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.cache
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.cache.remove(key).await;
        Ok(())
    }

    async fn snapshot(&self) -> AppResult<bool> {
        debug!("In-memory cache has no snapshot to take");
        Ok(false)
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}
