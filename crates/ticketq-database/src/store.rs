//! Store traits the queue core is written against.
//!
//! Concurrency for the same job id or idempotency key is resolved by each
//! store's own atomic upsert / compare-and-set, never by a process-local
//! lock, because several worker processes share one store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use ticketq_core::result::AppResult;
use ticketq_entity::idempotency::IdempotencyRecord;
use ticketq_entity::job::Job;

/// Durable record of Tier 1 jobs.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Insert the job, or update its mutable columns if the id already exists.
    async fn upsert(&self, job: &Job) -> AppResult<()>;

    /// Find a job by ID.
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>>;

    /// Move a job to `processing` and count the attempt. Returns the updated row.
    async fn mark_processing(&self, id: Uuid) -> AppResult<Option<Job>>;

    /// Move a non-terminal job back to `pending`.
    async fn mark_pending(&self, id: Uuid) -> AppResult<bool>;

    /// Mark a job as completed with its result.
    async fn mark_completed(&self, id: Uuid, result: Option<&Value>) -> AppResult<bool>;

    /// Mark a job as failed with an error message.
    async fn mark_failed(&self, id: Uuid, error: &str) -> AppResult<bool>;

    /// Jobs left `pending` or `processing` that were created at or after `since`,
    /// oldest first.
    async fn find_recoverable(&self, since: DateTime<Utc>) -> AppResult<Vec<Job>>;

    /// Delete terminal jobs last updated before `before`.
    async fn cleanup_terminal(&self, before: DateTime<Utc>) -> AppResult<u64>;
}

/// Result of trying to claim an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The key was free (or expired) and now belongs to the caller's job.
    Claimed,
    /// A live record already holds the key.
    Existing(IdempotencyRecord),
}

/// Durable record of idempotency keys.
#[async_trait]
pub trait IdempotencyRecordStore: Send + Sync + std::fmt::Debug + 'static {
    /// Find a record by key, expired or not.
    async fn find(&self, key: &str) -> AppResult<Option<IdempotencyRecord>>;

    /// Atomically insert the record, or replace an expired one holding the same key.
    async fn claim(&self, record: &IdempotencyRecord) -> AppResult<ClaimOutcome>;

    /// Store the result of the key's job unless one is already stored.
    ///
    /// Returns the record as it stands afterwards, so a losing writer sees the
    /// winning result.
    async fn store_result(
        &self,
        key: &str,
        result: &Value,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<IdempotencyRecord>>;

    /// Drop the claim on `key` if it still belongs to `job_id` and has no result.
    async fn release(&self, key: &str, job_id: Uuid) -> AppResult<bool>;

    /// Hand `record.key` to `record`'s job if it is still held by
    /// `stale_job_id` and has no result. Returns whether the record was replaced.
    async fn take_over(&self, stale_job_id: Uuid, record: &IdempotencyRecord) -> AppResult<bool>;

    /// Delete records that expired before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;
}
