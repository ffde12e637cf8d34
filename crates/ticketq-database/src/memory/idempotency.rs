use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use uuid::Uuid;

use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_entity::idempotency::IdempotencyRecord;

use crate::store::{ClaimOutcome, IdempotencyRecordStore};

/// In-memory idempotency record store.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdempotencyStore {
    records: Arc<DashMap<String, IdempotencyRecord>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryIdempotencyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as an unreachable database would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::database("Idempotency store is unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyRecordStore for MemoryIdempotencyStore {
    async fn find(&self, key: &str) -> AppResult<Option<IdempotencyRecord>> {
        self.check_available()?;
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn claim(&self, record: &IdempotencyRecord) -> AppResult<ClaimOutcome> {
        self.check_available()?;
        match self.records.entry(record.key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(ClaimOutcome::Claimed)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired_at(Utc::now()) {
                    slot.insert(record.clone());
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::Existing(slot.get().clone()))
                }
            }
        }
    }

    async fn store_result(
        &self,
        key: &str,
        result: &Value,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<IdempotencyRecord>> {
        self.check_available()?;
        Ok(self.records.get_mut(key).map(|mut record| {
            if record.cached_result.is_none() {
                record.cached_result = Some(result.clone());
                record.expires_at = expires_at;
            }
            record.clone()
        }))
    }

    async fn release(&self, key: &str, job_id: Uuid) -> AppResult<bool> {
        self.check_available()?;
        Ok(self
            .records
            .remove_if(key, |_, r| r.job_id == job_id && r.cached_result.is_none())
            .is_some())
    }

    async fn take_over(&self, stale_job_id: Uuid, record: &IdempotencyRecord) -> AppResult<bool> {
        self.check_available()?;
        let Some(mut held) = self.records.get_mut(&record.key) else {
            return Ok(false);
        };
        if held.job_id != stale_job_id || held.cached_result.is_some() {
            return Ok(false);
        }
        *held = record.clone();
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.check_available()?;
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired_at(now));
        Ok((before - self.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(job_id: Uuid, ttl: Duration) -> IdempotencyRecord {
        IdempotencyRecord::claim("refund-TX123", "refund-process", "hash", job_id, ttl)
    }

    #[tokio::test]
    async fn test_second_claim_sees_first() {
        let store = MemoryIdempotencyStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            store.claim(&record(first, Duration::hours(24))).await.unwrap(),
            ClaimOutcome::Claimed
        );
        match store.claim(&record(second, Duration::hours(24))).await.unwrap() {
            ClaimOutcome::Existing(existing) => assert_eq!(existing.job_id, first),
            ClaimOutcome::Claimed => panic!("key claimed twice"),
        }
    }

    #[tokio::test]
    async fn test_expired_claim_is_replaced() {
        let store = MemoryIdempotencyStore::new();
        store
            .claim(&record(Uuid::new_v4(), Duration::seconds(-1)))
            .await
            .unwrap();

        let fresh = Uuid::new_v4();
        assert_eq!(
            store.claim(&record(fresh, Duration::hours(24))).await.unwrap(),
            ClaimOutcome::Claimed
        );
        let stored = store.find("refund-TX123").await.unwrap().unwrap();
        assert_eq!(stored.job_id, fresh);
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let store = MemoryIdempotencyStore::new();
        store
            .claim(&record(Uuid::new_v4(), Duration::hours(24)))
            .await
            .unwrap();

        let expires = Utc::now() + Duration::hours(24);
        store
            .store_result("refund-TX123", &json!({"refundId": "r1"}), expires)
            .await
            .unwrap();
        let after = store
            .store_result("refund-TX123", &json!({"refundId": "r2"}), expires)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(after.cached_result, Some(json!({"refundId": "r1"})));
    }

    #[tokio::test]
    async fn test_release_only_drops_own_pending_claim() {
        let store = MemoryIdempotencyStore::new();
        let owner = Uuid::new_v4();
        store.claim(&record(owner, Duration::hours(24))).await.unwrap();

        assert!(!store.release("refund-TX123", Uuid::new_v4()).await.unwrap());
        assert!(store.release("refund-TX123", owner).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_take_over_requires_stale_owner_without_result() {
        let store = MemoryIdempotencyStore::new();
        let stale = Uuid::new_v4();
        store.claim(&record(stale, Duration::hours(24))).await.unwrap();

        let fresh = record(Uuid::new_v4(), Duration::hours(24));
        assert!(!store.take_over(Uuid::new_v4(), &fresh).await.unwrap());
        assert!(store.take_over(stale, &fresh).await.unwrap());
        assert_eq!(
            store.find("refund-TX123").await.unwrap().unwrap().job_id,
            fresh.job_id
        );

        // A second taker racing on the same stale owner loses.
        let late = record(Uuid::new_v4(), Duration::hours(24));
        assert!(!store.take_over(stale, &late).await.unwrap());

        // Once a result is stored the key can no longer change hands.
        let expires = Utc::now() + Duration::hours(24);
        store
            .store_result("refund-TX123", &json!({"refundId": "r1"}), expires)
            .await
            .unwrap();
        assert!(!store.take_over(fresh.job_id, &late).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryIdempotencyStore::new();
        store
            .claim(&record(Uuid::new_v4(), Duration::seconds(-1)))
            .await
            .unwrap();
        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.len(), 0);
    }
}
