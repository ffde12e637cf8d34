//! Tiered persistence of job state.
//!
//! | Tier | Where state lives | On failure |
//! |---|---|---|
//! | 1 critical | relational store, mirrored into the fast cache | error to the caller |
//! | 2 standard | fast cache, snapshotted every N writes | logged, treated as success |
//! | 3 ephemeral | broker memory only | n/a |
//!
//! Every Tier 1 transition is written to the durable store before the call
//! returns, so recovery after a crash sees it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ticketq_cache::CacheManager;
use ticketq_cache::keys as cache_keys;
use ticketq_core::config::QueueConfig;
use ticketq_core::result::AppResult;
use ticketq_core::traits::CacheProvider;
use ticketq_database::JobStore;
use ticketq_entity::job::{DurabilityTier, Job, JobStatus};

/// Records job state according to each job's durability tier.
#[derive(Debug)]
pub struct TieredPersistence {
    store: Arc<dyn JobStore>,
    cache: CacheManager,
    standard_ttl: Duration,
    snapshot_every: u64,
    standard_writes: AtomicU64,
}

impl TieredPersistence {
    /// Create the persistence layer.
    pub fn new(store: Arc<dyn JobStore>, cache: CacheManager, config: &QueueConfig) -> Self {
        Self {
            store,
            cache,
            standard_ttl: Duration::from_secs(config.standard_ttl_seconds),
            snapshot_every: config.snapshot_every_writes.max(1),
            standard_writes: AtomicU64::new(0),
        }
    }

    /// Record a newly admitted job (or overwrite its current state).
    ///
    /// For Tier 1 an error means the job is not admitted and must not be dispatched.
    pub async fn save(&self, job: &Job) -> AppResult<()> {
        match job.tier {
            DurabilityTier::Critical => {
                self.durable(job, "save", self.store.upsert(job)).await?;
                self.mirror(job).await;
                Ok(())
            }
            DurabilityTier::Standard => {
                self.write_standard(job).await;
                Ok(())
            }
            DurabilityTier::Ephemeral => Ok(()),
        }
    }

    /// Record the start of an attempt.
    ///
    /// Returns the job as it now stands, or `None` when a Tier 1 row is
    /// missing or already completed and the attempt must not run.
    pub async fn mark_processing(&self, job: &Job) -> AppResult<Option<Job>> {
        match job.tier {
            DurabilityTier::Critical => {
                let updated = self
                    .durable(job, "mark_processing", self.store.mark_processing(job.id))
                    .await?;
                if let Some(updated) = &updated {
                    self.mirror(updated).await;
                }
                Ok(updated)
            }
            DurabilityTier::Standard | DurabilityTier::Ephemeral => {
                let mut updated = job.clone();
                updated.status = JobStatus::Processing;
                updated.attempts += 1;
                updated.updated_at = Utc::now();
                if job.tier == DurabilityTier::Standard {
                    self.write_standard(&updated).await;
                }
                Ok(Some(updated))
            }
        }
    }

    /// Put a job back to `pending`, e.g. after its run was throttled.
    pub async fn mark_pending(&self, job: &Job) -> AppResult<()> {
        let mut updated = job.clone();
        updated.status = JobStatus::Pending;
        updated.updated_at = Utc::now();
        self.transition(job, &updated, "mark_pending", self.store.mark_pending(job.id))
            .await
    }

    /// Record a successful run and its result.
    pub async fn mark_complete(&self, job: &Job, result: Option<&Value>) -> AppResult<()> {
        let mut updated = job.clone();
        updated.status = JobStatus::Completed;
        updated.result = result.cloned();
        updated.error_message = None;
        updated.updated_at = Utc::now();
        self.transition(
            job,
            &updated,
            "mark_complete",
            self.store.mark_completed(job.id, result),
        )
        .await
    }

    /// Record a failed run.
    pub async fn mark_failed(&self, job: &Job, error: &str) -> AppResult<()> {
        let mut updated = job.clone();
        updated.status = JobStatus::Failed;
        updated.error_message = Some(error.to_string());
        updated.updated_at = Utc::now();
        self.transition(
            job,
            &updated,
            "mark_failed",
            self.store.mark_failed(job.id, error),
        )
        .await
    }

    /// Load a job, fast cache first, then the durable store.
    ///
    /// Tier 3 jobs are never found.
    pub async fn load(&self, id: Uuid) -> AppResult<Option<Job>> {
        match self.cache.get_json::<Job>(&cache_keys::job(id)).await {
            Ok(Some(job)) => return Ok(Some(job)),
            Ok(None) => {}
            Err(e) => warn!(job_id = %id, error = %e, "Job cache read failed"),
        }

        let found = self.store.find_by_id(id).await?;
        if let Some(job) = &found {
            self.mirror(job).await;
        }
        Ok(found)
    }

    /// Number of Tier 2 writes since start.
    pub fn standard_writes(&self) -> u64 {
        self.standard_writes.load(Ordering::Relaxed)
    }

    async fn transition<F>(&self, job: &Job, updated: &Job, op: &'static str, write: F) -> AppResult<()>
    where
        F: Future<Output = AppResult<bool>>,
    {
        match job.tier {
            DurabilityTier::Critical => {
                if !self.durable(job, op, write).await? {
                    warn!(job_id = %job.id, op, "Durable transition matched no row");
                }
                self.mirror(updated).await;
            }
            DurabilityTier::Standard => self.write_standard(updated).await,
            DurabilityTier::Ephemeral => {}
        }
        Ok(())
    }

    /// Await a durable write, logging failures with the job's identity.
    async fn durable<T, F>(&self, job: &Job, op: &'static str, write: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        write.await.inspect_err(|e| {
            error!(
                job_id = %job.id,
                tier = job.tier.level(),
                queue = %job.queue_name,
                op,
                error = %e,
                "Durable job write failed"
            );
        })
    }

    /// Copy a Tier 1 job into the fast cache. Failures only cost latency.
    async fn mirror(&self, job: &Job) {
        if let Err(e) = self.cache.set_json(&cache_keys::job(job.id), job, self.standard_ttl).await {
            warn!(job_id = %job.id, error = %e, "Failed to mirror job into cache");
        }
    }

    async fn write_standard(&self, job: &Job) {
        if let Err(e) = self
            .cache
            .set_json(&cache_keys::job(job.id), job, self.standard_ttl)
            .await
        {
            warn!(job_id = %job.id, tier = job.tier.level(), error = %e, "Tier 2 cache write failed");
        }

        let writes = self.standard_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.snapshot_every == 0 {
            let cache = self.cache.clone();
            tokio::spawn(async move {
                match cache.snapshot().await {
                    Ok(true) => info!(writes, "Cache snapshot requested"),
                    Ok(false) => debug!(writes, "Cache backend has no snapshot"),
                    Err(e) => warn!(writes, error = %e, "Cache snapshot failed"),
                }
            });
        }
    }
}
