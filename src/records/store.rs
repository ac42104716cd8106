use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{NutritionRecord, Nutrients, RecordRef, RecordStatus, VerificationAttempt};

/// Single-row update. `None` leaves the column untouched; `append_details` is
/// appended to the audit log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub status: Option<RecordStatus>,
    pub quality_score: Option<u8>,
    pub attempt_count: Option<u32>,
    pub review_flags: Option<Vec<String>>,
    pub nutrients: Option<Nutrients>,
    pub serving_grams: Option<f64>,
    pub append_details: Vec<VerificationAttempt>,
    pub last_verification: Option<OffsetDateTime>,
    pub release_claim: bool,
}

impl RecordPatch {
    /// Values a patch would leave on `record`; both stores share this.
    pub fn apply_to(&self, record: &mut NutritionRecord) {
        if let Some(s) = self.status {
            record.status = s;
        }
        if let Some(q) = self.quality_score {
            record.quality_score = q;
        }
        if let Some(a) = self.attempt_count {
            record.attempt_count = a;
        }
        if let Some(flags) = &self.review_flags {
            record.review_flags = flags.clone();
        }
        if let Some(n) = &self.nutrients {
            record.nutrients = n.clone();
            record.serving_grams = self.serving_grams;
        }
        record
            .verification_details
            .extend(self.append_details.iter().cloned());
        if let Some(ts) = self.last_verification {
            record.last_verification = Some(ts);
        }
        if self.release_claim {
            record.claimed_by = None;
            record.claimed_at = None;
        }
    }
}

/// Returned by [`RecordStore::write`] when the record is no longer claimed by
/// the writing worker, e.g. after its claim was swept and taken by another.
#[derive(Debug, Error)]
#[error("food item {id} is no longer claimed by {worker_id}")]
pub struct ClaimLost {
    pub id: Uuid,
    pub worker_id: String,
}

/// Persistence seam for the verifier. `claim_pending` must be atomic across
/// concurrent callers, and `write` only lands while the caller owns the claim.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Moves up to `limit` pending records to `claimed`, owned by `worker_id`.
    async fn claim_pending(&self, worker_id: &str, limit: usize) -> anyhow::Result<Vec<RecordRef>>;
    async fn read(&self, id: Uuid) -> anyhow::Result<NutritionRecord>;
    /// Applies `patch` iff the record is `claimed` by `worker_id`; otherwise
    /// fails with [`ClaimLost`] and leaves the row untouched.
    async fn write(&self, id: Uuid, worker_id: &str, patch: &RecordPatch) -> anyhow::Result<()>;
    /// Returns claims older than `stale_after` to `pending`.
    async fn sweep_stale_claims(&self, stale_after: Duration) -> anyhow::Result<u64>;
}
