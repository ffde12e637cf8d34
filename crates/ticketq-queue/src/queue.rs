//! Job submission: admission through the limiter and the idempotency store,
//! tiered persistence, then hand-off to the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ticketq_core::config::QueueConfig;
use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_entity::idempotency::IdempotencyRecord;
use ticketq_entity::job::{DurabilityTier, Job, JobPriority, JobStatus};

use crate::broker::Broker;
use crate::idempotency::{Admission, IdempotencyService};
use crate::limiter::RateLimiter;
use crate::monitor::metrics::QueueMetrics;
use crate::persistence::TieredPersistence;

/// Parameters for submitting a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Queue name (e.g., "money", "communication", "background")
    pub queue_name: String,
    /// Business job type (e.g., "payment-process")
    pub job_type: String,
    /// Job payload as JSON
    pub payload: Value,
    /// Priority level
    #[serde(default)]
    pub priority: JobPriority,
    /// Durability tier, fixed for the job's lifetime
    pub tier: DurabilityTier,
    /// Explicit idempotency key; derived from the payload when absent
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Limiter key gating this submission, if admissions are rate limited
    #[serde(default)]
    pub admission_key: Option<String>,
}

impl EnqueueRequest {
    /// Create a request with normal priority and a derived idempotency key.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: Value,
        tier: DurabilityTier,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority: JobPriority::default(),
            tier,
            idempotency_key: None,
            admission_key: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Use an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Gate the submission on a limiter key.
    pub fn with_admission_key(mut self, key: impl Into<String>) -> Self {
        self.admission_key = Some(key.into());
        self
    }
}

/// Outcome of `enqueue`. Duplicates and throttling are expected results, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new job was admitted and handed to the broker.
    Queued {
        /// Id of the new job.
        job_id: Uuid,
    },
    /// A live idempotency record already covers this submission; nothing was dispatched.
    Duplicate {
        /// Id of the job admitted first.
        job_id: Uuid,
        /// Its result, if it has finished.
        cached_result: Option<Value>,
    },
    /// The admission limiter had no capacity before the deadline.
    Throttled {
        /// Limiter key that was exhausted.
        admission_key: String,
    },
}

impl EnqueueOutcome {
    /// Id of the job this submission resolved to.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Queued { job_id } | Self::Duplicate { job_id, .. } => Some(*job_id),
            Self::Throttled { .. } => None,
        }
    }
}

/// Producer-facing job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    persistence: Arc<TieredPersistence>,
    idempotency: Arc<IdempotencyService>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<QueueMetrics>,
    config: QueueConfig,
    admission_timeout: Duration,
}

impl JobQueue {
    /// Create a new job queue
    pub fn new(
        broker: Arc<dyn Broker>,
        persistence: Arc<TieredPersistence>,
        idempotency: Arc<IdempotencyService>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<QueueMetrics>,
        config: QueueConfig,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            persistence,
            idempotency,
            limiter,
            metrics,
            config,
            admission_timeout,
        }
    }

    /// Submit a job.
    ///
    /// Returns the first job's id (and result, once it has one) without
    /// dispatching anything when the derived key is already held. A Tier 1
    /// job counts as queued only after its row is durably written.
    pub async fn enqueue(&self, request: EnqueueRequest) -> AppResult<EnqueueOutcome> {
        let Some(definition) = self.config.queue(&request.queue_name) else {
            return Err(AppError::validation(format!(
                "Unknown queue '{}'",
                request.queue_name
            )));
        };
        if !self.broker.knows_queue(&request.queue_name) {
            return Err(AppError::validation(format!(
                "Broker does not serve queue '{}'",
                request.queue_name
            )));
        }
        if request.job_type.trim().is_empty() {
            return Err(AppError::validation("Job type must not be empty"));
        }
        let max_attempts = definition.max_attempts;

        let Some(admission_key) = request.admission_key.clone() else {
            return self.admit(request, max_attempts).await;
        };
        if let Err(timeout) = self
            .limiter
            .acquire(&admission_key, self.admission_timeout)
            .await
        {
            self.metrics.record_throttled();
            debug!(admission_key = %timeout.service_key, "Submission throttled");
            return Ok(EnqueueOutcome::Throttled { admission_key });
        }
        let outcome = self.admit(request, max_attempts).await;
        self.limiter.release(&admission_key);
        outcome
    }

    async fn admit(&self, request: EnqueueRequest, max_attempts: i32) -> AppResult<EnqueueOutcome> {
        let key = match &request.idempotency_key {
            Some(key) => key.clone(),
            None => self
                .idempotency
                .derive_key(&request.job_type, &request.payload),
        };

        let job = Job::new(
            request.queue_name,
            request.job_type,
            request.payload,
            request.priority,
            request.tier,
            max_attempts,
        )
        .with_idempotency_key(key.clone());

        let mut admission = self
            .idempotency
            .admit(&key, &job.job_type, &job.payload, job.id)
            .await?;
        if let Admission::Existing(record) = &admission {
            if !record.has_result() && self.is_abandoned(record).await? {
                info!(
                    key = %key,
                    stale_job_id = %record.job_id,
                    "Resubmitting intent of abandoned job"
                );
                let stale = record.clone();
                admission = self
                    .idempotency
                    .take_over(&stale, &job.job_type, &job.payload, job.id)
                    .await?;
            }
        }

        match admission {
            Admission::Existing(record) => {
                self.metrics.record_duplicate();
                info!(key = %key, job_id = %record.job_id, "Duplicate submission collapsed");
                return Ok(EnqueueOutcome::Duplicate {
                    job_id: record.job_id,
                    cached_result: record.cached_result,
                });
            }
            Admission::Claimed { .. } => {}
        }

        if let Err(e) = self.persistence.save(&job).await {
            self.release_claim(&key, job.id).await;
            return Err(e);
        }

        if let Err(e) = self.broker.submit(&job, max_attempts).await {
            error!(job_id = %job.id, queue = %job.queue_name, error = %e, "Broker rejected job");
            if let Err(mark) = self.persistence.mark_failed(&job, &e.to_string()).await {
                error!(job_id = %job.id, error = %mark, "Failed to mark rejected job as failed");
            }
            self.release_claim(&key, job.id).await;
            return Err(AppError::broker(format!("Failed to dispatch job {}: {e}", job.id)));
        }

        self.metrics.record_enqueued();
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %job.queue_name,
            tier = job.tier.level(),
            priority = job.priority.as_str(),
            "Job enqueued"
        );
        Ok(EnqueueOutcome::Queued { job_id: job.id })
    }

    /// Coarse cancellation: stop a job from being delivered again and mark it failed.
    ///
    /// A handler already running is not interrupted. Returns whether the
    /// broker still held the job.
    pub async fn cancel(&self, job_id: Uuid) -> AppResult<bool> {
        let removed = self.broker.remove(job_id).await?;
        if let Some(job) = self.persistence.load(job_id).await? {
            if !job.status.is_terminal() {
                self.persistence.mark_failed(&job, "Cancelled").await?;
            }
            // A running handler may still record a result, so only a job
            // pulled before delivery gives up its key.
            if removed {
                if let Some(key) = &job.idempotency_key {
                    self.release_claim(key, job.id).await;
                }
            }
        }
        info!(job_id = %job_id, removed, "Job cancelled");
        Ok(removed)
    }

    /// Current state of a Tier 1 or Tier 2 job.
    pub async fn job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        self.persistence.load(job_id).await
    }

    /// Whether the job behind a result-less claim can no longer produce a result.
    ///
    /// A job the broker still holds is live. Otherwise a failed job is dead,
    /// and a job with no persisted state at all (a crash between claim and
    /// write, or a lost Tier 3 job) is dead once the claim outlives the
    /// orphan grace period.
    async fn is_abandoned(&self, record: &IdempotencyRecord) -> AppResult<bool> {
        if self.broker.holds(record.job_id).await? {
            return Ok(false);
        }
        match self.persistence.load(record.job_id).await? {
            Some(job) => Ok(job.status == JobStatus::Failed),
            None => Ok((Utc::now() - record.created_at)
                .to_std()
                .is_ok_and(|age| age >= self.idempotency.orphan_grace())),
        }
    }

    async fn release_claim(&self, key: &str, job_id: Uuid) {
        if let Err(e) = self.idempotency.release(key, job_id).await {
            warn!(key, job_id = %job_id, error = %e, "Failed to release idempotency claim");
        }
    }
}
