//! Startup recovery configuration.

use serde::{Deserialize, Serialize};

/// Recovery manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Whether recovery runs at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Jobs created longer ago than this are left for manual triage.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_hours: default_lookback_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_lookback_hours() -> i64 {
    24
}
