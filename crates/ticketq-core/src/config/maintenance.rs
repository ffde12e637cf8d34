//! Periodic maintenance configuration.

use serde::{Deserialize, Serialize};

/// Cron schedules for housekeeping tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Whether the maintenance scheduler runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cron expression (with seconds) for purging expired idempotency records.
    #[serde(default = "default_purge_cron")]
    pub idempotency_purge_cron: String,
    /// Cron expression (with seconds) for deleting old terminal job rows.
    #[serde(default = "default_cleanup_cron")]
    pub job_cleanup_cron: String,
    /// Completed and failed jobs older than this many days are deleted.
    #[serde(default = "default_retention_days")]
    pub job_retention_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idempotency_purge_cron: default_purge_cron(),
            job_cleanup_cron: default_cleanup_cron(),
            job_retention_days: default_retention_days(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_purge_cron() -> String {
    "0 0 * * * *".to_string()
}

fn default_cleanup_cron() -> String {
    "0 30 3 * * *".to_string()
}

fn default_retention_days() -> i64 {
    30
}
