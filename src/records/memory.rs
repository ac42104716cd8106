use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{NutritionRecord, RecordRef, RecordStatus};
use super::store::{ClaimLost, RecordPatch, RecordStore};

/// Mutex-guarded record map. Claims happen under one lock acquisition, which
/// gives the same exclusivity as the Postgres `SKIP LOCKED` claim.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<Uuid, NutritionRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: NutritionRecord) -> Uuid {
        let id = record.id;
        self.inner.lock().await.insert(id, record);
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<NutritionRecord> {
        self.inner.lock().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<NutritionRecord> {
        self.inner.lock().await.values().cloned().collect()
    }

    pub async fn count_with_status(&self, status: RecordStatus) -> usize {
        self.inner
            .lock()
            .await
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn claim_pending(&self, worker_id: &str, limit: usize) -> anyhow::Result<Vec<RecordRef>> {
        let mut map = self.inner.lock().await;
        let mut candidates: Vec<(u8, Uuid)> = map
            .values()
            .filter(|r| r.status == RecordStatus::Pending)
            .map(|r| (r.quality_score, r.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let now = OffsetDateTime::now_utc();
        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, id) in candidates.into_iter().take(limit) {
            if let Some(r) = map.get_mut(&id) {
                r.status = RecordStatus::Claimed;
                r.claimed_by = Some(worker_id.to_string());
                r.claimed_at = Some(now);
                claimed.push(RecordRef { id });
            }
        }
        Ok(claimed)
    }

    async fn read(&self, id: Uuid) -> anyhow::Result<NutritionRecord> {
        self.inner
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("food item {id} not found"))
    }

    async fn write(&self, id: Uuid, worker_id: &str, patch: &RecordPatch) -> anyhow::Result<()> {
        let mut map = self.inner.lock().await;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("food item {id} not found"))?;
        if record.status != RecordStatus::Claimed || record.claimed_by.as_deref() != Some(worker_id) {
            return Err(ClaimLost { id, worker_id: worker_id.to_string() }.into());
        }
        patch.apply_to(record);
        Ok(())
    }

    async fn sweep_stale_claims(&self, stale_after: Duration) -> anyhow::Result<u64> {
        let now = OffsetDateTime::now_utc();
        let mut swept = 0;
        for r in self.inner.lock().await.values_mut() {
            let stale = r.status == RecordStatus::Claimed
                && r
                    .claimed_at
                    .map_or(true, |at| now - at >= stale_after);
            if stale {
                r.status = RecordStatus::Pending;
                r.claimed_by = None;
                r.claimed_at = None;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod memory_store_tests {
    use std::collections::HashSet;

    use super::*;
    use crate::records::model::Nutrients;

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..n {
            store
                .insert(NutritionRecord::new(format!("food-{i}"), Nutrients::default()))
                .await;
        }
        store
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = seeded(100).await;
        let mut handles = Vec::new();
        for k in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_pending(&format!("worker-{k}"), 10).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            let refs = h.await.unwrap();
            total += refs.len();
            for r in refs {
                assert!(seen.insert(r.id), "record {} claimed twice", r.id);
            }
        }
        assert_eq!(total, 80);
        assert_eq!(store.count_with_status(RecordStatus::Claimed).await, 80);
        assert_eq!(store.count_with_status(RecordStatus::Pending).await, 20);
    }

    #[tokio::test]
    async fn claim_takes_what_is_available_without_waiting() {
        let store = seeded(3).await;
        let first = store.claim_pending("w1", 10).await.unwrap();
        let second = store.claim_pending("w2", 10).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(second.is_empty());
        let r = store.get(first[0].id).await.unwrap();
        assert_eq!(r.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn claim_prefers_higher_quality_score() {
        let store = MemoryStore::new();
        let mut low = NutritionRecord::new("low", Nutrients::default());
        low.quality_score = 10;
        let mut high = NutritionRecord::new("high", Nutrients::default());
        high.quality_score = 80;
        store.insert(low).await;
        let high_id = store.insert(high).await;

        let refs = store.claim_pending("w", 1).await.unwrap();
        assert_eq!(refs, vec![RecordRef { id: high_id }]);
    }

    #[tokio::test]
    async fn sweep_returns_only_stale_claims() {
        let store = seeded(2).await;
        let refs = store.claim_pending("w", 2).await.unwrap();

        let swept = store.sweep_stale_claims(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(swept, 0);

        store
            .write(
                refs[0].id,
                "w",
                &RecordPatch {
                    status: Some(RecordStatus::Verified),
                    quality_score: Some(100),
                    release_claim: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let swept = store.sweep_stale_claims(Duration::ZERO).await.unwrap();
        assert_eq!(swept, 1);
        let back = store.get(refs[1].id).await.unwrap();
        assert_eq!(back.status, RecordStatus::Pending);
        assert!(back.claimed_by.is_none());
        assert_eq!(
            store.get(refs[0].id).await.unwrap().status,
            RecordStatus::Verified
        );
    }

    #[tokio::test]
    async fn write_to_missing_record_fails() {
        let store = MemoryStore::new();
        let err = store
            .write(Uuid::new_v4(), "w", &RecordPatch::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn write_after_losing_the_claim_is_rejected() {
        let store = seeded(1).await;
        let id = store.claim_pending("w1", 1).await.unwrap()[0].id;
        store.sweep_stale_claims(Duration::ZERO).await.unwrap();
        store.claim_pending("w2", 1).await.unwrap();
        store
            .write(id, "w2", &RecordPatch { attempt_count: Some(2), ..Default::default() })
            .await
            .unwrap();

        let err = store
            .write(id, "w1", &RecordPatch { attempt_count: Some(1), ..Default::default() })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ClaimLost>().is_some());
        let r = store.get(id).await.unwrap();
        assert_eq!(r.attempt_count, 2);
        assert_eq!(r.claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn write_to_unclaimed_record_is_rejected() {
        let store = seeded(1).await;
        let id = store.all().await[0].id;
        let err = store
            .write(id, "w", &RecordPatch { attempt_count: Some(1), ..Default::default() })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ClaimLost>().is_some());
        assert_eq!(store.get(id).await.unwrap().attempt_count, 0);
    }
}
