use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::model::{NutritionRecord, RecordRef};
use super::repo_types::FoodItemRow;
use super::store::{ClaimLost, RecordPatch, RecordStore};

const SELECT_COLUMNS: &str = r#"
    id, food_name, brand, category, serving_description, serving_grams,
    calories, protein_g, carbs_g, fat_g, fiber_g, sugar_g, alcohol_g,
    secondary_nutrients, verification_status, quality_score, verification_attempts,
    review_flags, verification_details, last_verification, claimed_by, claimed_at
"#;

#[derive(Clone)]
pub struct PgRecordStore {
    db: PgPool,
}

impl PgRecordStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn claim_pending(&self, worker_id: &str, limit: usize) -> anyhow::Result<Vec<RecordRef>> {
        // One statement: rows locked by a concurrent claimer are skipped, never shared.
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            WITH claimable AS (
                SELECT id
                  FROM food_items
                 WHERE verification_status = 'pending'
                 ORDER BY quality_score DESC, created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE food_items f
               SET verification_status = 'claimed',
                   claimed_by = $1,
                   claimed_at = now(),
                   updated_at = now()
              FROM claimable c
             WHERE f.id = c.id
            RETURNING f.id
            "#,
        )
        .bind(worker_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await
        .context("claim pending food items")?;

        debug!(worker_id, claimed = ids.len(), "claimed pending records");
        Ok(ids.into_iter().map(|(id,)| RecordRef { id }).collect())
    }

    async fn read(&self, id: Uuid) -> anyhow::Result<NutritionRecord> {
        let row = sqlx::query_as::<_, FoodItemRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM food_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.db)
        .await
        .with_context(|| format!("read food item {id}"))?;

        Ok(NutritionRecord::try_from(row)?)
    }

    async fn write(&self, id: Uuid, worker_id: &str, patch: &RecordPatch) -> anyhow::Result<()> {
        let nutrients = patch.nutrients.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE food_items SET
                verification_status   = COALESCE($2, verification_status),
                quality_score         = COALESCE($3, quality_score),
                verification_attempts = COALESCE($4, verification_attempts),
                review_flags          = COALESCE($5, review_flags),
                calories              = CASE WHEN $6 THEN $7  ELSE calories END,
                protein_g             = CASE WHEN $6 THEN $8  ELSE protein_g END,
                carbs_g               = CASE WHEN $6 THEN $9  ELSE carbs_g END,
                fat_g                 = CASE WHEN $6 THEN $10 ELSE fat_g END,
                fiber_g               = CASE WHEN $6 THEN $11 ELSE fiber_g END,
                sugar_g               = CASE WHEN $6 THEN $12 ELSE sugar_g END,
                alcohol_g             = CASE WHEN $6 THEN $13 ELSE alcohol_g END,
                serving_grams         = CASE WHEN $6 THEN $14 ELSE serving_grams END,
                secondary_nutrients   = CASE WHEN $6 THEN $15 ELSE secondary_nutrients END,
                verification_details  = verification_details || $16,
                last_verification     = COALESCE($17, last_verification),
                claimed_by            = CASE WHEN $18 THEN NULL ELSE claimed_by END,
                claimed_at            = CASE WHEN $18 THEN NULL ELSE claimed_at END,
                updated_at            = now()
            WHERE id = $1
              AND verification_status = 'claimed'
              AND claimed_by = $19
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.quality_score.map(i32::from))
        .bind(patch.attempt_count.map(|a| a as i32))
        .bind(patch.review_flags.as_deref())
        .bind(nutrients.is_some())
        .bind(nutrients.map(|n| n.calories))
        .bind(nutrients.map(|n| n.protein_g))
        .bind(nutrients.map(|n| n.carbs_g))
        .bind(nutrients.map(|n| n.fat_g))
        .bind(nutrients.and_then(|n| n.fiber_g))
        .bind(nutrients.and_then(|n| n.sugar_g))
        .bind(nutrients.and_then(|n| n.alcohol_g))
        .bind(patch.serving_grams)
        .bind(Json(nutrients.map(|n| n.secondary.clone()).unwrap_or_default()))
        .bind(Json(&patch.append_details))
        .bind(patch.last_verification)
        .bind(patch.release_claim)
        .bind(worker_id)
        .execute(&self.db)
        .await
        .with_context(|| format!("update food item {id}"))?;

        if result.rows_affected() == 0 {
            return Err(ClaimLost { id, worker_id: worker_id.to_string() }.into());
        }
        Ok(())
    }

    async fn sweep_stale_claims(&self, stale_after: Duration) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE food_items
               SET verification_status = 'pending',
                   claimed_by = NULL,
                   claimed_at = NULL,
                   updated_at = now()
             WHERE verification_status = 'claimed'
               AND claimed_at <= now() - make_interval(secs => $1)
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.db)
        .await
        .context("sweep stale claims")?;

        Ok(result.rows_affected())
    }
}
