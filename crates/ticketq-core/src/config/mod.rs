//! Application configuration schemas.
//!
//! All configuration structs are deserialized from TOML files via the
//! `config` crate. Each sub-module represents a logical configuration
//! section, and every field carries a default so partial files are valid.

pub mod cache;
pub mod database;
pub mod idempotency;
pub mod limiter;
pub mod logging;
pub mod maintenance;
pub mod monitoring;
pub mod queue;
pub mod recovery;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use self::cache::CacheConfig;
pub use self::database::DatabaseConfig;
pub use self::idempotency::IdempotencyConfig;
pub use self::limiter::{LimiterConfig, LimiterGroup, ServiceLimit};
pub use self::logging::LoggingConfig;
pub use self::maintenance::MaintenanceConfig;
pub use self::monitoring::{AlertMetric, AlertRuleConfig, AlertSeverity, MonitoringConfig};
pub use self::queue::{QueueConfig, QueueDefinition};
pub use self::recovery::RecoveryConfig;
pub use self::worker::WorkerConfig;

use crate::error::AppError;

/// Root application configuration.
///
/// This struct is the top-level deserialization target for the merged
/// TOML configuration files (default.toml + environment overlay).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tier 1 relational store settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Fast cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Queue topology and Tier 2 snapshot settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Idempotency record settings.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Downstream rate/concurrency limits.
    #[serde(default)]
    pub limiter: LimiterConfig,
    /// Startup recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Monitoring and alert rules.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Housekeeping schedules.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from TOML files.
    ///
    /// Merges the default configuration with an environment-specific overlay
    /// and environment variables prefixed with `TICKETQ_`.
    pub fn load(env: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("TICKETQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        let loaded: Self = config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the queue subsystem cannot operate with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.queue.queues.is_empty() {
            return Err(AppError::configuration("At least one queue must be defined"));
        }
        if self.queue.snapshot_every_writes == 0 {
            return Err(AppError::configuration(
                "queue.snapshot_every_writes must be greater than zero",
            ));
        }
        if self.idempotency.ttl_hours == 0 {
            return Err(AppError::configuration(
                "idempotency.ttl_hours must be greater than zero",
            ));
        }

        let limits = std::iter::once(("default", &self.limiter.default))
            .chain(self.limiter.services.iter().map(|(k, v)| (k.as_str(), v)))
            .chain(self.limiter.groups.iter().map(|g| (g.name.as_str(), &g.limit)));
        for (name, limit) in limits {
            if limit.max_per_second <= 0.0 || limit.max_concurrent == 0 || limit.burst_size == 0 {
                return Err(AppError::configuration(format!(
                    "Limiter '{name}' needs positive max_per_second, max_concurrent and burst_size"
                )));
            }
        }

        Ok(())
    }
}
