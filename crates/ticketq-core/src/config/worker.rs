//! Background worker configuration.

use serde::{Deserialize, Serialize};

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the worker is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of concurrent job processing tasks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Interval in milliseconds between broker polls when idle.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Base delay in milliseconds for the broker's exponential retry backoff.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Seconds to wait for in-flight jobs during shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            retry_backoff_ms: default_retry_backoff(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    250
}

fn default_retry_backoff() -> u64 {
    1_000
}

fn default_shutdown_grace() -> u64 {
    30
}
