//! Job executor: wraps registered handlers with idempotency, rate limiting
//! and persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use ticketq_core::error::AppError;
use ticketq_entity::job::Job;

use crate::idempotency::IdempotencyService;
use crate::limiter::{LimiterTimeout, RateLimiter};
use crate::monitor::metrics::QueueMetrics;
use crate::persistence::TieredPersistence;

/// Trait for job handler implementations
#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Get the job type this handler processes
    fn job_type(&self) -> &str;

    /// Downstream service this handler calls, if its calls are rate limited
    fn service_key(&self) -> Option<&str> {
        None
    }

    /// Execute the job with the given payload
    async fn execute(&self, job: &Job) -> Result<Option<Value>, JobExecutionError>;
}

/// Error from job execution
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// Permanent failure, do not retry
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// Transient failure, may retry
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// The downstream service had no capacity before the deadline
    #[error("Job throttled: {0}")]
    Throttled(#[from] LimiterTimeout),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

impl JobExecutionError {
    /// Whether the broker should deliver the job again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// How a delivered job was settled without error.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The handler ran and succeeded.
    Completed(Option<Value>),
    /// A result was already recorded under the job's idempotency key.
    Replayed(Value),
    /// The job had already completed; nothing ran.
    Skipped,
}

/// Dispatches jobs to the appropriate handler based on job_type
#[derive(Debug)]
pub struct JobExecutor {
    /// Registered job handlers by type
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    persistence: Arc<TieredPersistence>,
    idempotency: Arc<IdempotencyService>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<QueueMetrics>,
    acquire_timeout: Duration,
}

impl JobExecutor {
    /// Create a new job executor
    pub fn new(
        persistence: Arc<TieredPersistence>,
        idempotency: Arc<IdempotencyService>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<QueueMetrics>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            persistence,
            idempotency,
            limiter,
            metrics,
            acquire_timeout,
        }
    }

    /// Register a job handler
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        info!(job_type = %job_type, "Registered job handler");
        self.handlers.insert(job_type, handler);
    }

    /// Get the list of registered job types
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Run one delivery of a job.
    ///
    /// A result already recorded under the job's idempotency key is replayed
    /// without calling the handler. Otherwise the handler runs inside a
    /// limiter slot, and its outcome is written to the idempotency store and
    /// the persistence layer before this returns.
    pub async fn execute(&self, job: &Job) -> Result<ExecutionOutcome, JobExecutionError> {
        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            let msg = format!("No handler registered for job type '{}'", job.job_type);
            self.fail(job, &msg).await;
            return Err(JobExecutionError::Permanent(msg));
        };

        if let Some(key) = &job.idempotency_key {
            if let Some(result) = self.idempotency.check(key).await? {
                debug!(job_id = %job.id, key = %key, "Replaying recorded result");
                self.persistence.mark_complete(job, Some(&result)).await?;
                return Ok(ExecutionOutcome::Replayed(result));
            }
        }

        let service_key = handler.service_key().map(str::to_string);
        if let Some(service) = &service_key {
            if let Err(timeout) = self.limiter.acquire(service, self.acquire_timeout).await {
                self.metrics.record_throttled();
                self.persistence.mark_pending(job).await?;
                return Err(timeout.into());
            }
        }

        let running = match self.persistence.mark_processing(job).await {
            Ok(Some(running)) => running,
            Ok(None) => {
                self.release(service_key.as_deref());
                debug!(job_id = %job.id, "Job already settled, skipping");
                return Ok(ExecutionOutcome::Skipped);
            }
            Err(e) => {
                self.release(service_key.as_deref());
                return Err(e.into());
            }
        };

        info!(
            job_id = %running.id,
            job_type = %running.job_type,
            attempt = running.attempts,
            max_attempts = running.max_attempts,
            "Executing job"
        );

        let outcome = handler.execute(&running).await;
        self.release(service_key.as_deref());

        match outcome {
            Ok(result) => {
                // The key gets the result first, so a retry after a failed
                // completion write replays instead of running again.
                if let Some(key) = &running.idempotency_key {
                    let recorded = result.clone().unwrap_or(Value::Null);
                    self.idempotency
                        .record(key, &recorded, self.idempotency.ttl())
                        .await?;
                }
                self.persistence
                    .mark_complete(&running, result.as_ref())
                    .await?;
                self.metrics.record_completed();
                info!(job_id = %running.id, "Job completed");
                Ok(ExecutionOutcome::Completed(result))
            }
            Err(e) => {
                warn!(job_id = %running.id, error = %e, "Job failed");
                self.fail(&running, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Free the idempotency key of a job that will never run again.
    ///
    /// A resubmission of the same intent is then admitted as a new job.
    /// A key that already carries a result is left untouched.
    pub async fn abandon(&self, job: &Job) {
        let Some(key) = &job.idempotency_key else {
            return;
        };
        match self.idempotency.release(key, job.id).await {
            Ok(true) => info!(job_id = %job.id, key = %key, "Released key of failed job"),
            Ok(false) => debug!(job_id = %job.id, key = %key, "Key no longer held by job"),
            Err(e) => {
                warn!(job_id = %job.id, key = %key, error = %e, "Failed to release idempotency key");
            }
        }
    }

    async fn fail(&self, job: &Job, msg: &str) {
        self.metrics.record_failed();
        if let Err(e) = self.persistence.mark_failed(job, msg).await {
            error!(job_id = %job.id, error = %e, "Failed to record job failure");
        }
    }

    fn release(&self, service_key: Option<&str>) {
        if let Some(service) = service_key {
            self.limiter.release(service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use ticketq_cache::CacheManager;
    use ticketq_cache::memory::MemoryCacheProvider;
    use ticketq_core::config::cache::MemoryCacheConfig;
    use ticketq_core::config::{IdempotencyConfig, LimiterConfig, QueueConfig, ServiceLimit};
    use ticketq_database::JobStore;
    use ticketq_database::memory::{MemoryIdempotencyStore, MemoryJobStore};
    use ticketq_entity::job::{DurabilityTier, JobPriority, JobStatus};

    use crate::idempotency::KeyDerivationRegistry;

    #[derive(Debug, Default)]
    struct RefundHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for RefundHandler {
        fn job_type(&self) -> &str {
            "refund-process"
        }

        fn service_key(&self) -> Option<&str> {
            Some("stripe")
        }

        async fn execute(&self, job: &Job) -> Result<Option<Value>, JobExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(JobExecutionError::Transient("processor unavailable".into()));
            }
            Ok(Some(json!({"refunded": job.payload["transactionId"]})))
        }
    }

    struct Harness {
        executor: JobExecutor,
        store: MemoryJobStore,
        persistence: Arc<TieredPersistence>,
        idempotency: Arc<IdempotencyService>,
        limiter: Arc<RateLimiter>,
    }

    fn harness(handler: Arc<RefundHandler>, limit: ServiceLimit) -> Harness {
        let store = MemoryJobStore::new();
        let cache = CacheManager::from_provider(Arc::new(MemoryCacheProvider::new(
            &MemoryCacheConfig::default(),
        )));
        let metrics = Arc::new(QueueMetrics::default());
        let persistence = Arc::new(TieredPersistence::new(
            Arc::new(store.clone()),
            cache.clone(),
            &QueueConfig::default(),
        ));
        let idempotency = Arc::new(IdempotencyService::new(
            cache,
            Arc::new(MemoryIdempotencyStore::new()),
            KeyDerivationRegistry::with_defaults(),
            &IdempotencyConfig::default(),
        ));
        let mut limiter_config = LimiterConfig::default();
        limiter_config.services.insert("stripe".to_string(), limit);
        let limiter = Arc::new(RateLimiter::new(&limiter_config, Arc::clone(&metrics)));

        let mut executor = JobExecutor::new(
            Arc::clone(&persistence),
            Arc::clone(&idempotency),
            Arc::clone(&limiter),
            metrics,
            Duration::from_millis(100),
        );
        executor.register(handler);
        Harness {
            executor,
            store,
            persistence,
            idempotency,
            limiter,
        }
    }

    async fn admitted_refund(h: &Harness) -> Job {
        let payload = json!({"transactionId": "TX123"});
        let job = Job::new(
            "money",
            "refund-process",
            payload.clone(),
            JobPriority::High,
            DurabilityTier::Critical,
            5,
        )
        .with_idempotency_key("refund-TX123");
        h.idempotency
            .admit("refund-TX123", "refund-process", &payload, job.id)
            .await
            .unwrap();
        h.persistence.save(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_success_records_result_and_completes() {
        let handler = Arc::new(RefundHandler::default());
        let h = harness(Arc::clone(&handler), ServiceLimit::new(10.0, 2, 5));
        let job = admitted_refund(&h).await;

        let outcome = h.executor.execute(&job).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed(Some(json!({"refunded": "TX123"})))
        );
        assert_eq!(
            h.idempotency.check("refund-TX123").await.unwrap(),
            Some(json!({"refunded": "TX123"}))
        );
        let row = h.store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.attempts, 1);
        assert_eq!(h.limiter.in_flight("stripe"), 0);
    }

    #[tokio::test]
    async fn test_recorded_result_is_replayed() {
        let handler = Arc::new(RefundHandler::default());
        let h = harness(Arc::clone(&handler), ServiceLimit::new(10.0, 2, 5));
        let job = admitted_refund(&h).await;

        h.executor.execute(&job).await.unwrap();
        let again = h.executor.execute(&job).await.unwrap();

        assert_eq!(again, ExecutionOutcome::Replayed(json!({"refunded": "TX123"})));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_failed_and_releases_slot() {
        let handler = Arc::new(RefundHandler {
            fail: true,
            ..RefundHandler::default()
        });
        let h = harness(Arc::clone(&handler), ServiceLimit::new(10.0, 1, 5));
        let job = admitted_refund(&h).await;

        let err = h.executor.execute(&job).await.unwrap_err();
        assert!(err.is_retryable());
        let row = h.store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some(err.to_string().as_str()));
        assert_eq!(h.limiter.in_flight("stripe"), 0);
        assert_eq!(h.idempotency.check("refund-TX123").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_run_goes_back_to_pending() {
        let handler = Arc::new(RefundHandler::default());
        let h = harness(Arc::clone(&handler), ServiceLimit::new(1.0, 1, 1));
        h.limiter.acquire("stripe", Duration::ZERO).await.unwrap();
        let job = admitted_refund(&h).await;

        let err = h.executor.execute(&job).await.unwrap_err();
        assert!(matches!(err, JobExecutionError::Throttled(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let row = h.store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.attempts, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_permanently() {
        let h = harness(Arc::new(RefundHandler::default()), ServiceLimit::default());
        let job = Job::new(
            "background",
            "venue-sync",
            json!({}),
            JobPriority::Low,
            DurabilityTier::Critical,
            3,
        );
        h.persistence.save(&job).await.unwrap();

        let err = h.executor.execute(&job).await.unwrap_err();
        assert!(!err.is_retryable());
        let row = h.store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
    }
}
