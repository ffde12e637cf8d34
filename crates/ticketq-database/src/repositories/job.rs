//! Job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use ticketq_core::error::{AppError, ErrorKind};
use ticketq_core::result::AppResult;
use ticketq_entity::job::Job;

use crate::store::JobStore;

/// PostgreSQL repository for Tier 1 job rows.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    /// Create a new job repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn upsert(&self, job: &Job) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO jobs (id, queue_name, job_type, data, priority, tier, idempotency_key, \
             status, attempts, max_attempts, result, error_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (id) DO UPDATE SET \
                status = EXCLUDED.status, \
                attempts = GREATEST(jobs.attempts, EXCLUDED.attempts), \
                result = EXCLUDED.result, \
                error_message = EXCLUDED.error_message, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.tier)
        .bind(&job.idempotency_key)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to upsert job", e))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find job", e))
    }

    async fn mark_processing(&self, id: Uuid) -> AppResult<Option<Job>> {
        sqlx::query_as::<_, Job>(
            "UPDATE jobs SET status = 'processing', attempts = attempts + 1, updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'processing', 'failed') RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to mark job as processing", e)
        })
    }

    async fn mark_pending(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = NOW() \
             WHERE id = $1 AND status <> 'completed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to mark job as pending", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, id: Uuid, result: Option<&Value>) -> AppResult<bool> {
        let outcome = sqlx::query(
            "UPDATE jobs SET status = 'completed', result = $2, error_message = NULL, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to complete job", e))?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> AppResult<bool> {
        let outcome = sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = $2, updated_at = NOW() \
             WHERE id = $1 AND status <> 'completed'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to mark job as failed", e)
        })?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn find_recoverable(&self, since: DateTime<Utc>) -> AppResult<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs \
             WHERE tier = 'critical' AND status IN ('pending', 'processing') AND created_at >= $1 \
             ORDER BY created_at ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to scan recoverable jobs", e)
        })
    }

    async fn cleanup_terminal(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to cleanup jobs", e))?;
        Ok(result.rows_affected())
    }
}
