//! Job entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::status::{DurabilityTier, JobPriority, JobStatus};

/// A background job.
///
/// `id` is also the broker's native job id, so a recovered job is
/// resubmitted under the identity it was first admitted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,
    /// Queue the job is routed to.
    pub queue_name: String,
    /// Business job type (e.g., `"payment-process"`).
    pub job_type: String,
    /// Job-specific payload (JSON).
    #[sqlx(rename = "data")]
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    /// Job priority.
    pub priority: JobPriority,
    /// Durability tier declared at creation.
    pub tier: DurabilityTier,
    /// Fingerprint collapsing logically duplicate submissions.
    pub idempotency_key: Option<String>,
    /// Current job status.
    pub status: JobStatus,
    /// Number of execution attempts started so far.
    pub attempts: i32,
    /// Maximum allowed attempts.
    pub max_attempts: i32,
    /// Result data on completion (JSON).
    pub result: Option<serde_json::Value>,
    /// Error message of the last failed attempt.
    pub error_message: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a freshly admitted job in the `pending` state.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: JobPriority,
        tier: DurabilityTier,
        max_attempts: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority,
            tier,
            idempotency_key: None,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach an idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attempts left before the job is exhausted.
    pub fn remaining_attempts(&self) -> i32 {
        (self.max_attempts - self.attempts).max(0)
    }

    /// Check if the broker may deliver the job again after a failure.
    pub fn can_retry(&self) -> bool {
        !matches!(self.status, JobStatus::Completed) && self.remaining_attempts() > 0
    }
}
