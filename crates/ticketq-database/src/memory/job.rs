use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_entity::job::{DurabilityTier, Job, JobStatus};

use crate::store::JobStore;

/// In-memory job store.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    rows: Arc<DashMap<Uuid, Job>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as an unreachable database would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::database("Job store is unavailable"));
        }
        Ok(())
    }

    fn update<F>(&self, id: Uuid, apply: F) -> AppResult<bool>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        self.check_available()?;
        Ok(match self.rows.get_mut(&id) {
            Some(mut row) => {
                let changed = apply(&mut row);
                if changed {
                    row.updated_at = Utc::now();
                }
                changed
            }
            None => false,
        })
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, job: &Job) -> AppResult<()> {
        self.check_available()?;
        self.rows
            .entry(job.id)
            .and_modify(|row| {
                row.status = job.status;
                row.attempts = row.attempts.max(job.attempts);
                row.result = job.result.clone();
                row.error_message = job.error_message.clone();
                row.updated_at = job.updated_at;
            })
            .or_insert_with(|| job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>> {
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    async fn mark_processing(&self, id: Uuid) -> AppResult<Option<Job>> {
        self.check_available()?;
        Ok(self.rows.get_mut(&id).and_then(|mut row| {
            if row.status == JobStatus::Completed {
                return None;
            }
            row.status = JobStatus::Processing;
            row.attempts += 1;
            row.updated_at = Utc::now();
            Some(row.clone())
        }))
    }

    async fn mark_pending(&self, id: Uuid) -> AppResult<bool> {
        self.update(id, |row| {
            if row.status == JobStatus::Completed {
                return false;
            }
            row.status = JobStatus::Pending;
            true
        })
    }

    async fn mark_completed(&self, id: Uuid, result: Option<&Value>) -> AppResult<bool> {
        self.update(id, |row| {
            row.status = JobStatus::Completed;
            row.result = result.cloned();
            row.error_message = None;
            true
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> AppResult<bool> {
        self.update(id, |row| {
            if row.status == JobStatus::Completed {
                return false;
            }
            row.status = JobStatus::Failed;
            row.error_message = Some(error.to_string());
            true
        })
    }

    async fn find_recoverable(&self, since: DateTime<Utc>) -> AppResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .rows
            .iter()
            .filter(|row| {
                row.tier == DurabilityTier::Critical
                    && row.status.is_recoverable()
                    && row.created_at >= since
            })
            .map(|row| row.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn cleanup_terminal(&self, before: DateTime<Utc>) -> AppResult<u64> {
        self.check_available()?;
        let before_len = self.rows.len();
        self.rows
            .retain(|_, row| !(row.status.is_terminal() && row.updated_at < before));
        Ok((before_len - self.rows.len()) as u64)
    }
}
