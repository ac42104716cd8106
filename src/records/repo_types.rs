use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{NutritionRecord, Nutrients, RecordStatus, UnknownStatus, VerificationAttempt};

#[derive(Debug, FromRow)]
pub struct FoodItemRow {
    pub id: Uuid,
    pub food_name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub serving_description: Option<String>,
    pub serving_grams: Option<f64>,
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sugar_g: Option<f64>,
    pub alcohol_g: Option<f64>,
    pub secondary_nutrients: Json<BTreeMap<String, f64>>,
    pub verification_status: String,
    pub quality_score: i32,
    pub verification_attempts: i32,
    pub review_flags: Vec<String>,
    pub verification_details: Json<Vec<VerificationAttempt>>,
    pub last_verification: Option<OffsetDateTime>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<OffsetDateTime>,
}

impl TryFrom<FoodItemRow> for NutritionRecord {
    type Error = UnknownStatus;

    fn try_from(r: FoodItemRow) -> Result<Self, Self::Error> {
        let status: RecordStatus = r.verification_status.parse()?;
        Ok(Self {
            id: r.id,
            food_name: r.food_name,
            brand: r.brand,
            category: r.category,
            serving_description: r.serving_description,
            serving_grams: r.serving_grams,
            nutrients: Nutrients {
                calories: r.calories.unwrap_or(0.0),
                protein_g: r.protein_g.unwrap_or(0.0),
                carbs_g: r.carbs_g.unwrap_or(0.0),
                fat_g: r.fat_g.unwrap_or(0.0),
                fiber_g: r.fiber_g,
                sugar_g: r.sugar_g,
                alcohol_g: r.alcohol_g,
                secondary: r.secondary_nutrients.0,
            },
            status,
            quality_score: r.quality_score.clamp(0, 100) as u8,
            attempt_count: r.verification_attempts.max(0) as u32,
            review_flags: r.review_flags,
            verification_details: r.verification_details.0,
            last_verification: r.last_verification,
            claimed_by: r.claimed_by,
            claimed_at: r.claimed_at,
        })
    }
}
