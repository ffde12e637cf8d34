//! Cron scheduler for periodic maintenance tasks.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};

use ticketq_core::config::MaintenanceConfig;
use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_database::JobStore;

use crate::idempotency::IdempotencyService;

/// Housekeeping work run by the scheduler, callable directly as well
#[derive(Debug, Clone)]
pub struct MaintenanceTasks {
    idempotency: Arc<IdempotencyService>,
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl MaintenanceTasks {
    /// Create the task set
    pub fn new(
        idempotency: Arc<IdempotencyService>,
        store: Arc<dyn JobStore>,
        config: &MaintenanceConfig,
    ) -> Self {
        Self {
            idempotency,
            store,
            retention: Duration::days(config.job_retention_days),
        }
    }

    /// Delete idempotency records whose TTL has passed
    pub async fn purge_idempotency(&self) -> AppResult<u64> {
        let purged = self.idempotency.purge_expired().await?;
        tracing::info!(purged, "Purged expired idempotency records");
        Ok(purged)
    }

    /// Delete completed and failed jobs older than the retention period
    pub async fn cleanup_jobs(&self) -> AppResult<u64> {
        let before = Utc::now() - self.retention;
        let deleted = self.store.cleanup_terminal(before).await?;
        tracing::info!(deleted, before = %before, "Cleaned up terminal jobs");
        Ok(deleted)
    }
}

/// Cron-based scheduler for periodic background tasks
pub struct MaintenanceScheduler {
    /// The underlying job scheduler
    scheduler: JobScheduler,
    /// Work the schedules trigger
    tasks: MaintenanceTasks,
    /// Schedules
    config: MaintenanceConfig,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl MaintenanceScheduler {
    /// Create a new cron scheduler
    pub async fn new(tasks: MaintenanceTasks, config: MaintenanceConfig) -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::internal(format!("Failed to create scheduler: {e}")))?;

        Ok(Self {
            scheduler,
            tasks,
            config,
        })
    }

    /// Register all default scheduled tasks
    pub async fn register_default_tasks(&self) -> Result<(), AppError> {
        self.register_idempotency_purge().await?;
        self.register_job_cleanup().await?;

        tracing::info!("All scheduled tasks registered");
        Ok(())
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<(), AppError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::internal(format!("Failed to start scheduler: {e}")))?;

        tracing::info!("Cron scheduler started");
        Ok(())
    }

    /// Shutdown the scheduler
    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Failed to shutdown scheduler: {e}")))?;

        tracing::info!("Cron scheduler shut down");
        Ok(())
    }

    /// Expired idempotency record purge
    async fn register_idempotency_purge(&self) -> Result<(), AppError> {
        let tasks = self.tasks.clone();
        let job = CronJob::new_async(self.config.idempotency_purge_cron.as_str(), move |_uuid, _lock| {
            let tasks = tasks.clone();
            Box::pin(async move {
                if let Err(e) = tasks.purge_idempotency().await {
                    tracing::error!(error = %e, "Idempotency purge failed");
                }
            })
        })
        .map_err(|e| {
            AppError::internal(format!("Failed to create idempotency_purge schedule: {e}"))
        })?;

        self.scheduler.add(job).await.map_err(|e| {
            AppError::internal(format!("Failed to add idempotency_purge schedule: {e}"))
        })?;

        tracing::info!(cron = %self.config.idempotency_purge_cron, "Registered: idempotency_purge");
        Ok(())
    }

    /// Terminal job cleanup
    async fn register_job_cleanup(&self) -> Result<(), AppError> {
        let tasks = self.tasks.clone();
        let job = CronJob::new_async(self.config.job_cleanup_cron.as_str(), move |_uuid, _lock| {
            let tasks = tasks.clone();
            Box::pin(async move {
                if let Err(e) = tasks.cleanup_jobs().await {
                    tracing::error!(error = %e, "Job cleanup failed");
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create job_cleanup schedule: {e}")))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::internal(format!("Failed to add job_cleanup schedule: {e}")))?;

        tracing::info!(cron = %self.config.job_cleanup_cron, "Registered: job_cleanup");
        Ok(())
    }
}
