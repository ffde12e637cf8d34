//! Cache key builders for every queue cache entry.
//!
//! The Redis provider adds its configured prefix on top of these.

use uuid::Uuid;

/// Cache key for a job snapshot by ID.
pub fn job(job_id: Uuid) -> String {
    format!("job:{job_id}")
}

/// Cache key for an idempotency record by its derived key.
pub fn idempotency(key: &str) -> String {
    format!("idem:{key}")
}
