//! Idempotency key repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use ticketq_core::error::{AppError, ErrorKind};
use ticketq_core::result::AppResult;
use ticketq_entity::idempotency::IdempotencyRecord;

use crate::store::{ClaimOutcome, IdempotencyRecordStore};

/// PostgreSQL repository for idempotency records.
#[derive(Debug, Clone)]
pub struct IdempotencyRepository {
    pool: PgPool,
}

impl IdempotencyRepository {
    /// Create a new idempotency repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRecordStore for IdempotencyRepository {
    async fn find(&self, key: &str) -> AppResult<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRecord>("SELECT * FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to find idempotency key", e)
            })
    }

    async fn claim(&self, record: &IdempotencyRecord) -> AppResult<ClaimOutcome> {
        // A conflicting live row suppresses the update, so no row comes back.
        let claimed: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO idempotency_keys \
             (key, operation_type, request_hash, job_id, cached_result, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, NULL, $5, $6) \
             ON CONFLICT (key) DO UPDATE SET \
                operation_type = EXCLUDED.operation_type, \
                request_hash = EXCLUDED.request_hash, \
                job_id = EXCLUDED.job_id, \
                cached_result = NULL, \
                created_at = EXCLUDED.created_at, \
                expires_at = EXCLUDED.expires_at \
             WHERE idempotency_keys.expires_at <= NOW() \
             RETURNING job_id",
        )
        .bind(&record.key)
        .bind(&record.operation_type)
        .bind(&record.request_hash)
        .bind(record.job_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to claim idempotency key", e)
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        match self.find(&record.key).await? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Err(AppError::conflict(format!(
                "Idempotency key '{}' changed while being claimed",
                record.key
            ))),
        }
    }

    async fn store_result(
        &self,
        key: &str,
        result: &Value,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<IdempotencyRecord>> {
        let updated = sqlx::query_as::<_, IdempotencyRecord>(
            "UPDATE idempotency_keys SET cached_result = $2, expires_at = $3 \
             WHERE key = $1 AND cached_result IS NULL RETURNING *",
        )
        .bind(key)
        .bind(result)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to store idempotent result", e)
        })?;

        match updated {
            Some(record) => Ok(Some(record)),
            None => self.find(key).await,
        }
    }

    async fn release(&self, key: &str, job_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys \
             WHERE key = $1 AND job_id = $2 AND cached_result IS NULL",
        )
        .bind(key)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to release idempotency key", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn take_over(&self, stale_job_id: Uuid, record: &IdempotencyRecord) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE idempotency_keys SET \
                operation_type = $3, \
                request_hash = $4, \
                job_id = $5, \
                created_at = $6, \
                expires_at = $7 \
             WHERE key = $1 AND job_id = $2 AND cached_result IS NULL",
        )
        .bind(&record.key)
        .bind(stale_job_id)
        .bind(&record.operation_type)
        .bind(&record.request_hash)
        .bind(record.job_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to take over idempotency key", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to purge idempotency keys", e)
            })?;
        Ok(result.rows_affected())
    }
}
