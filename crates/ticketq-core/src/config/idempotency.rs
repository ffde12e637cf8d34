//! Idempotency configuration.

use serde::{Deserialize, Serialize};

/// Idempotency store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Lifetime of an idempotency record in hours. Must exceed the longest retry window.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    /// Seconds a result-less claim whose job cannot be found is left alone
    /// before another submission may take the key over.
    #[serde(default = "default_orphan_grace_seconds")]
    pub orphan_grace_seconds: u64,
}

impl IdempotencyConfig {
    /// Record lifetime as a [`std::time::Duration`].
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_hours * 3600)
    }

    /// Orphaned-claim grace period as a [`std::time::Duration`].
    pub fn orphan_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.orphan_grace_seconds)
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            orphan_grace_seconds: default_orphan_grace_seconds(),
        }
    }
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_orphan_grace_seconds() -> u64 {
    60
}
