//! Downstream rate and concurrency limits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Token-bucket limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Upper bound in milliseconds on a single cooperative wait step.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long a worker waits for a slot and a token before the run is throttled.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Limits applied to service keys with no explicit entry.
    #[serde(default)]
    pub default: ServiceLimit,
    /// Per-service-key limits.
    #[serde(default = "default_services")]
    pub services: HashMap<String, ServiceLimit>,
    /// Groups of service keys that share a single bucket.
    #[serde(default = "default_groups")]
    pub groups: Vec<LimiterGroup>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            acquire_timeout_ms: default_acquire_timeout(),
            default: ServiceLimit::default(),
            services: default_services(),
            groups: default_groups(),
        }
    }
}

/// Rate and concurrency limits for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimit {
    /// Sustained admissions per second (token refill rate).
    pub max_per_second: f64,
    /// Maximum calls in flight at once.
    pub max_concurrent: usize,
    /// Bucket capacity: admissions allowed in a burst on top of the refill rate.
    pub burst_size: u32,
}

impl ServiceLimit {
    /// Create a new limit.
    pub fn new(max_per_second: f64, max_concurrent: usize, burst_size: u32) -> Self {
        Self {
            max_per_second,
            max_concurrent,
            burst_size,
        }
    }
}

impl Default for ServiceLimit {
    fn default() -> Self {
        Self::new(10.0, 5, 10)
    }
}

/// A set of service keys that draw from one shared bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterGroup {
    /// Group name, used as the bucket identity.
    pub name: String,
    /// Service keys routed to this group's bucket.
    pub members: Vec<String>,
    /// Limits of the shared bucket.
    pub limit: ServiceLimit,
}

fn default_poll_interval() -> u64 {
    50
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_services() -> HashMap<String, ServiceLimit> {
    HashMap::from([
        ("stripe".to_string(), ServiceLimit::new(25.0, 10, 50)),
        ("twilio".to_string(), ServiceLimit::new(10.0, 5, 10)),
        ("sendgrid".to_string(), ServiceLimit::new(50.0, 10, 100)),
    ])
}

fn default_groups() -> Vec<LimiterGroup> {
    vec![LimiterGroup {
        name: "solana".to_string(),
        members: vec!["solana-rpc".to_string(), "nft-mint".to_string()],
        limit: ServiceLimit::new(10.0, 5, 20),
    }]
}
