//! Idempotency store: maps a derived job fingerprint to the job admitted
//! under it and, once that job succeeds, to its result.
//!
//! Lookups go to the fast cache first and fall back to the durable store,
//! backfilling the cache. Admission claims a key with the durable store's
//! own insert-if-absent, so concurrent producers in different processes
//! still collapse onto one job.

pub mod keys;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use ticketq_cache::CacheManager;
use ticketq_cache::keys as cache_keys;
use ticketq_core::config::IdempotencyConfig;
use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_core::traits::CacheProvider;
use ticketq_database::{ClaimOutcome, IdempotencyRecordStore};
use ticketq_entity::idempotency::IdempotencyRecord;

pub use keys::{KeyDerivationRegistry, KeyDeriver, request_hash};

/// Result of trying to admit a job under an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The key is now held by the new job.
    Claimed {
        /// Key that was claimed.
        key: String,
    },
    /// A live record already holds the key.
    Existing(IdempotencyRecord),
}

/// Idempotency service over the fast cache and the durable record store.
#[derive(Debug, Clone)]
pub struct IdempotencyService {
    cache: CacheManager,
    store: Arc<dyn IdempotencyRecordStore>,
    registry: Arc<KeyDerivationRegistry>,
    ttl: Duration,
    orphan_grace: Duration,
}

impl IdempotencyService {
    /// Create the service.
    pub fn new(
        cache: CacheManager,
        store: Arc<dyn IdempotencyRecordStore>,
        registry: KeyDerivationRegistry,
        config: &IdempotencyConfig,
    ) -> Self {
        Self {
            cache,
            store,
            registry: Arc::new(registry),
            ttl: config.ttl(),
            orphan_grace: config.orphan_grace(),
        }
    }

    /// Lifetime of new records.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How long a result-less claim with no traceable job is left alone.
    pub fn orphan_grace(&self) -> Duration {
        self.orphan_grace
    }

    /// Derive the key for a job. Pure and deterministic.
    pub fn derive_key(&self, job_type: &str, payload: &Value) -> String {
        self.registry.derive(job_type, payload)
    }

    /// Result previously recorded under `key`, if its record is still live.
    pub async fn check(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(self.lookup(key).await?.and_then(|r| r.cached_result))
    }

    /// Live record held under `key`, whether or not its job has finished.
    pub async fn lookup(&self, key: &str) -> AppResult<Option<IdempotencyRecord>> {
        let now = Utc::now();
        let cache_key = cache_keys::idempotency(key);

        match self.cache.get_json::<IdempotencyRecord>(&cache_key).await {
            // A cached claim without a result may have been completed by another worker.
            Ok(Some(record)) if record.has_result() && !record.is_expired_at(now) => {
                return Ok(Some(record));
            }
            Ok(_) => {}
            Err(e) => warn!(key, error = %e, "Idempotency cache read failed"),
        }

        let Some(record) = self.store.find(key).await? else {
            return Ok(None);
        };
        if record.is_expired_at(now) {
            return Ok(None);
        }
        self.cache_record(&record).await;
        Ok(Some(record))
    }

    /// Claim `key` for `job_id`, or return the live record already holding it.
    pub async fn admit(
        &self,
        key: &str,
        job_type: &str,
        payload: &Value,
        job_id: Uuid,
    ) -> AppResult<Admission> {
        if let Some(existing) = self.lookup(key).await? {
            return Ok(Admission::Existing(existing));
        }

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::configuration(format!("Invalid idempotency TTL: {e}")))?;
        let record = IdempotencyRecord::claim(key, job_type, request_hash(payload), job_id, ttl);

        match self.store.claim(&record).await? {
            ClaimOutcome::Claimed => {
                debug!(key, job_id = %job_id, "Claimed idempotency key");
                Ok(Admission::Claimed {
                    key: key.to_string(),
                })
            }
            ClaimOutcome::Existing(existing) => {
                debug!(key, job_id = %existing.job_id, "Idempotency key already held");
                self.cache_record(&existing).await;
                Ok(Admission::Existing(existing))
            }
        }
    }

    /// Move a result-less claim from a job that can no longer finish to `job_id`.
    ///
    /// The store only swaps the record while `stale` still holds it, so of
    /// several producers racing on the same dead claim exactly one wins; the
    /// others see the winner's record.
    pub async fn take_over(
        &self,
        stale: &IdempotencyRecord,
        job_type: &str,
        payload: &Value,
        job_id: Uuid,
    ) -> AppResult<Admission> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::configuration(format!("Invalid idempotency TTL: {e}")))?;
        let record =
            IdempotencyRecord::claim(&stale.key, job_type, request_hash(payload), job_id, ttl);

        if self.store.take_over(stale.job_id, &record).await? {
            debug!(
                key = %stale.key,
                stale_job_id = %stale.job_id,
                job_id = %job_id,
                "Took over idempotency key"
            );
            if let Err(e) = self.cache.delete(&cache_keys::idempotency(&stale.key)).await {
                warn!(key = %stale.key, error = %e, "Failed to evict taken-over idempotency key");
            }
            return Ok(Admission::Claimed {
                key: stale.key.clone(),
            });
        }

        // Lost the race, or the stale job's claim was released meanwhile.
        self.admit(&stale.key, job_type, payload, job_id).await
    }

    /// Attach a job's result to its key. The first result wins.
    ///
    /// Returns the record as stored, which carries the winning result, or
    /// `None` when no record holds the key any more.
    pub async fn record(
        &self,
        key: &str,
        result: &Value,
        ttl: Duration,
    ) -> AppResult<Option<IdempotencyRecord>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AppError::validation(format!("Invalid idempotency TTL: {e}")))?;
        let stored = self.store.store_result(key, result, Utc::now() + ttl).await?;

        match &stored {
            Some(record) => self.cache_record(record).await,
            None => warn!(key, "No idempotency record to attach the result to"),
        }
        Ok(stored)
    }

    /// Give up a claim that did not lead to an admitted job.
    pub async fn release(&self, key: &str, job_id: Uuid) -> AppResult<bool> {
        let released = self.store.release(key, job_id).await?;
        if let Err(e) = self.cache.delete(&cache_keys::idempotency(key)).await {
            warn!(key, error = %e, "Failed to evict released idempotency key from cache");
        }
        Ok(released)
    }

    /// Delete expired records from the durable store.
    pub async fn purge_expired(&self) -> AppResult<u64> {
        self.store.purge_expired(Utc::now()).await
    }

    async fn cache_record(&self, record: &IdempotencyRecord) {
        let Ok(remaining) = (record.expires_at - Utc::now()).to_std() else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        let cache_key = cache_keys::idempotency(&record.key);
        if let Err(e) = self.cache.set_json(&cache_key, record, remaining).await {
            warn!(key = %record.key, error = %e, "Failed to cache idempotency record");
        }
    }
}
