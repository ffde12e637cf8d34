//! Startup recovery of Tier 1 jobs that were pending or running when the
//! previous process stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use ticketq_core::config::RecoveryConfig;
use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_database::JobStore;
use ticketq_entity::job::Job;

use crate::broker::Broker;
use crate::monitor::metrics::QueueMetrics;

/// Counts from one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Rows returned by the scan.
    pub scanned: usize,
    /// Jobs handed back to the broker.
    pub recovered: usize,
    /// Jobs the broker already held under the same id.
    pub already_queued: usize,
    /// Jobs naming a queue the broker does not serve.
    pub unknown_queue: usize,
    /// Jobs with no attempts left, now marked failed.
    pub exhausted: usize,
    /// Jobs that could not be resubmitted or updated.
    pub failed: usize,
}

enum Resubmission {
    Recovered,
    AlreadyQueued,
    UnknownQueue,
    Exhausted,
}

/// Resubmits unfinished critical jobs once per process start.
#[derive(Debug)]
pub struct RecoveryManager {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    metrics: Arc<QueueMetrics>,
    lookback: Duration,
    ran: AtomicBool,
}

impl RecoveryManager {
    /// Create the recovery manager.
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        metrics: Arc<QueueMetrics>,
        config: &RecoveryConfig,
    ) -> Self {
        Self {
            store,
            broker,
            metrics,
            lookback: Duration::hours(config.lookback_hours),
            ran: AtomicBool::new(false),
        }
    }

    /// Scan the durable store and resubmit every critical job created within
    /// the lookback window that is still `pending` or `processing`.
    ///
    /// Jobs keep their id and their remaining attempts. A job that fails to
    /// resubmit is logged and skipped; only a failed scan aborts the pass.
    /// Calling this a second time on the same manager is an error.
    pub async fn recover_pending_jobs(&self) -> AppResult<RecoveryReport> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(AppError::conflict("Recovery has already run in this process"));
        }

        let since = Utc::now() - self.lookback;
        let jobs = self.store.find_recoverable(since).await?;
        let mut report = RecoveryReport {
            scanned: jobs.len(),
            ..RecoveryReport::default()
        };

        for job in &jobs {
            match self.resubmit(job).await {
                Ok(Resubmission::Recovered) => report.recovered += 1,
                Ok(Resubmission::AlreadyQueued) => report.already_queued += 1,
                Ok(Resubmission::UnknownQueue) => report.unknown_queue += 1,
                Ok(Resubmission::Exhausted) => report.exhausted += 1,
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        queue = %job.queue_name,
                        job_type = %job.job_type,
                        error = %e,
                        "Failed to recover job"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            recovered = report.recovered,
            already_queued = report.already_queued,
            unknown_queue = report.unknown_queue,
            exhausted = report.exhausted,
            failed = report.failed,
            "Job recovery finished"
        );
        Ok(report)
    }

    async fn resubmit(&self, job: &Job) -> AppResult<Resubmission> {
        if !self.broker.knows_queue(&job.queue_name) {
            warn!(job_id = %job.id, queue = %job.queue_name, "Skipping job for unknown queue");
            return Ok(Resubmission::UnknownQueue);
        }

        let remaining = job.remaining_attempts();
        if remaining == 0 {
            self.store
                .mark_failed(job.id, "Attempts exhausted before recovery")
                .await?;
            warn!(job_id = %job.id, attempts = job.attempts, "Recovered job had no attempts left");
            return Ok(Resubmission::Exhausted);
        }

        if !self.broker.submit(job, remaining).await? {
            debug!(job_id = %job.id, "Broker already holds job");
            return Ok(Resubmission::AlreadyQueued);
        }
        // A job interrupted mid-run waits in the broker again.
        self.store.mark_pending(job.id).await?;
        self.metrics.record_recovered();
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %job.queue_name,
            remaining_attempts = remaining,
            "Recovered job"
        );
        Ok(Resubmission::Recovered)
    }
}
