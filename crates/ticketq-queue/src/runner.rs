//! Worker runner: main loop that pulls deliveries from the broker and executes them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::time;

use ticketq_core::config::WorkerConfig;

use crate::broker::{Broker, Delivery};
use crate::executor::{ExecutionOutcome, JobExecutionError, JobExecutor};

/// Largest exponent applied to the retry backoff.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Main worker runner that polls queues and executes jobs
#[derive(Debug)]
pub struct WorkerRunner {
    /// Broker to pull deliveries from
    broker: Arc<dyn Broker>,
    /// Job executor for dispatching
    executor: Arc<JobExecutor>,
    /// Worker configuration
    config: WorkerConfig,
    /// Worker identifier
    worker_id: String,
    /// Queues to poll
    queues: Vec<String>,
}

impl WorkerRunner {
    /// Create a runner polling every queue the broker serves
    pub fn new(
        broker: Arc<dyn Broker>,
        executor: Arc<JobExecutor>,
        config: WorkerConfig,
        worker_id: String,
    ) -> Self {
        let queues = broker.queue_names();
        Self {
            broker,
            executor,
            config,
            worker_id,
            queues,
        }
    }

    /// Start the worker runner; runs until the cancel signal is received
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(
            worker_id = %self.worker_id,
            concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            queues = ?self.queues,
            "Worker started"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        tracing::info!(worker_id = %self.worker_id, "Worker received shutdown signal");
                        break;
                    }
                }
                dispatched = self.poll_and_execute(&semaphore) => {
                    if dispatched {
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.changed() => {
                            if *cancel.borrow() {
                                tracing::info!(worker_id = %self.worker_id, "Worker shutting down");
                                break;
                            }
                        }
                        _ = time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Waiting for in-flight jobs to complete");

        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        if time::timeout(grace, semaphore.acquire_many(permits)).await.is_err() {
            tracing::warn!(worker_id = %self.worker_id, "Shutdown grace period elapsed with jobs still running");
        }

        tracing::info!(worker_id = %self.worker_id, "Worker shut down complete");
    }

    /// Pull one delivery and spawn its execution. Returns whether a job was dispatched.
    async fn poll_and_execute(&self, semaphore: &Arc<Semaphore>) -> bool {
        let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
            tracing::trace!("All worker slots occupied, waiting...");
            return false;
        };

        match self.broker.next(&self.queues).await {
            Ok(Some(delivery)) => {
                let broker = Arc::clone(&self.broker);
                let executor = Arc::clone(&self.executor);
                let backoff = Duration::from_millis(self.config.retry_backoff_ms);

                tokio::spawn(async move {
                    let _permit = permit;
                    settle(broker.as_ref(), &executor, delivery, backoff).await;
                });
                true
            }
            Ok(None) => {
                tracing::trace!("No jobs available in queues");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to pull delivery");
                false
            }
        }
    }
}

/// Execute one delivery and report its outcome to the broker.
pub async fn settle(
    broker: &dyn Broker,
    executor: &JobExecutor,
    delivery: Delivery,
    backoff: Duration,
) {
    let job = delivery.job;
    let job_id = job.id;

    match executor.execute(&job).await {
        Ok(outcome) => {
            match outcome {
                ExecutionOutcome::Completed(_) => tracing::debug!(job_id = %job_id, "Job completed"),
                ExecutionOutcome::Replayed(_) => tracing::info!(job_id = %job_id, "Job replayed recorded result"),
                ExecutionOutcome::Skipped => tracing::debug!(job_id = %job_id, "Job already settled"),
            }
            ack(broker, job_id).await;
        }
        Err(JobExecutionError::Throttled(timeout)) => {
            tracing::info!(job_id = %job_id, service_key = %timeout.service_key, "Job throttled, requeueing");
            if let Err(e) = broker.requeue(job_id, backoff).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to requeue throttled job");
            }
        }
        Err(JobExecutionError::Permanent(msg)) => {
            tracing::error!(job_id = %job_id, error = %msg, "Job failed permanently");
            executor.abandon(&job).await;
            ack(broker, job_id).await;
        }
        Err(err) => {
            let used = (job.max_attempts - delivery.attempts_left).max(1);
            let exponent = u32::try_from(used - 1)
                .unwrap_or(0)
                .min(MAX_BACKOFF_EXPONENT);
            let delay = backoff.saturating_mul(1 << exponent);

            match broker.retry(job_id, delay).await {
                Ok(true) => tracing::warn!(
                    job_id = %job_id,
                    error = %err,
                    attempts_left = delivery.attempts_left,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job failed, retry scheduled"
                ),
                Ok(false) => {
                    tracing::error!(job_id = %job_id, error = %err, "Job failed with no attempts left");
                    executor.abandon(&job).await;
                    ack(broker, job_id).await;
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to schedule retry"),
            }
        }
    }
}

async fn ack(broker: &dyn Broker, job_id: uuid::Uuid) {
    if let Err(e) = broker.ack(job_id).await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to acknowledge job");
    }
}
