//! Cache provider configuration.

use serde::{Deserialize, Serialize};

/// Fast cache holding Tier 2 jobs, Tier 1 mirrors, and idempotency records.
///
/// Every entry carries its own TTL; the memory backend's `time_to_live_seconds`
/// is an upper bound on top of that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache provider type: `"memory"` or `"redis"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Redis-specific cache configuration.
    #[serde(default)]
    pub redis: RedisCacheConfig,
    /// In-memory cache configuration.
    #[serde(default)]
    pub memory: MemoryCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            redis: RedisCacheConfig::default(),
            memory: MemoryCacheConfig::default(),
        }
    }
}

/// Redis cache backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Key prefix for all queue cache keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// In-memory cache backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries in the cache.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    /// Upper bound on any entry's lifetime in seconds.
    #[serde(default = "default_memory_ttl")]
    pub time_to_live_seconds: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            time_to_live_seconds: default_memory_ttl(),
        }
    }
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "tq:".to_string()
}

fn default_max_capacity() -> u64 {
    100_000
}

fn default_memory_ttl() -> u64 {
    86_400
}
