//! Idempotency record model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Maps a derived job fingerprint to the job admitted under it and, once
/// the job has succeeded, to its immutable result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    /// Derived idempotency key (primary key).
    pub key: String,
    /// Job type that produced the key.
    pub operation_type: String,
    /// SHA-256 of the canonical request payload.
    pub request_hash: String,
    /// Job admitted under this key.
    pub job_id: Uuid,
    /// Result of the first successful execution. Never overwritten.
    pub cached_result: Option<serde_json::Value>,
    /// When the key was first claimed.
    pub created_at: DateTime<Utc>,
    /// When the record stops suppressing duplicates.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Build a record claiming `key` for `job_id`, valid for `ttl`.
    pub fn claim(
        key: impl Into<String>,
        operation_type: impl Into<String>,
        request_hash: impl Into<String>,
        job_id: Uuid,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            operation_type: operation_type.into(),
            request_hash: request_hash.into(),
            job_id,
            cached_result: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the record has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the record has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the job under this key already produced a result.
    pub fn has_result(&self) -> bool {
        self.cached_result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_expiry() {
        let record = IdempotencyRecord::claim(
            "refund-TX123",
            "refund-process",
            "abc",
            Uuid::nil(),
            Duration::hours(24),
        );
        assert!(!record.is_expired());
        assert!(record.is_expired_at(record.created_at + Duration::hours(25)));
        assert!(!record.has_result());
    }
}
