use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Verification lifecycle of a catalog row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Claimed,
    Verified,
    Flagged,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Claimed => "claimed",
            RecordStatus::Verified => "verified",
            RecordStatus::Flagged => "flagged",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Verified | RecordStatus::Flagged)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown verification status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for RecordStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RecordStatus::Pending),
            "claimed" => Ok(RecordStatus::Claimed),
            "verified" => Ok(RecordStatus::Verified),
            "flagged" => Ok(RecordStatus::Flagged),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Measured nutrient fields a rule can look at or the oracle can correct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NutrientField {
    Calories,
    ProteinG,
    CarbsG,
    FatG,
    FiberG,
    SugarG,
    AlcoholG,
    ServingGrams,
}

impl NutrientField {
    pub fn as_str(&self) -> &'static str {
        match self {
            NutrientField::Calories => "calories",
            NutrientField::ProteinG => "protein_g",
            NutrientField::CarbsG => "carbs_g",
            NutrientField::FatG => "fat_g",
            NutrientField::FiberG => "fiber_g",
            NutrientField::SugarG => "sugar_g",
            NutrientField::AlcoholG => "alcohol_g",
            NutrientField::ServingGrams => "serving_grams",
        }
    }
}

impl fmt::Display for NutrientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-serving nutrient values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrients {
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    pub fiber_g: Option<f64>,
    pub sugar_g: Option<f64>,
    pub alcohol_g: Option<f64>,
    /// Open set of secondary nutrients (sodium_mg, potassium_mg, ...).
    #[serde(default)]
    pub secondary: BTreeMap<String, f64>,
}

impl Nutrients {
    pub fn get(&self, field: NutrientField) -> Option<f64> {
        match field {
            NutrientField::Calories => Some(self.calories),
            NutrientField::ProteinG => Some(self.protein_g),
            NutrientField::CarbsG => Some(self.carbs_g),
            NutrientField::FatG => Some(self.fat_g),
            NutrientField::FiberG => self.fiber_g,
            NutrientField::SugarG => self.sugar_g,
            NutrientField::AlcoholG => self.alcohol_g,
            NutrientField::ServingGrams => None,
        }
    }
}

/// Replacement values proposed by the oracle. Absent fields are left alone;
/// unknown top-level keys are rejected, extra nutrients belong in `secondary`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldCorrections {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sugar_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alcohol_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_grams: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secondary: BTreeMap<String, f64>,
}

impl FieldCorrections {
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Flattened `(field_name, value)` pairs, primary fields first.
    pub fn entries(&self) -> Vec<(String, f64)> {
        let primary = [
            (NutrientField::Calories, self.calories),
            (NutrientField::ProteinG, self.protein_g),
            (NutrientField::CarbsG, self.carbs_g),
            (NutrientField::FatG, self.fat_g),
            (NutrientField::FiberG, self.fiber_g),
            (NutrientField::SugarG, self.sugar_g),
            (NutrientField::AlcoholG, self.alcohol_g),
            (NutrientField::ServingGrams, self.serving_grams),
        ];
        primary
            .into_iter()
            .filter_map(|(f, v)| v.map(|v| (f.as_str().to_string(), v)))
            .chain(self.secondary.iter().map(|(k, v)| (k.clone(), *v)))
            .collect()
    }
}

/// Kind of oracle answer recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Confirmed,
    Corrected,
}

/// One entry of the append-only `verification_details` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub attempt_number: u32,
    pub issues_found: Vec<String>,
    pub oracle_verdict_kind: VerdictKind,
    pub confidence: f64,
    /// Values actually written; empty when the verdict was discarded.
    #[serde(default)]
    pub fields_changed: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordRef {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutritionRecord {
    pub id: Uuid,
    pub food_name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub serving_description: Option<String>,
    pub serving_grams: Option<f64>,
    pub nutrients: Nutrients,
    pub status: RecordStatus,
    pub quality_score: u8,
    pub attempt_count: u32,
    pub review_flags: Vec<String>,
    pub verification_details: Vec<VerificationAttempt>,
    pub last_verification: Option<OffsetDateTime>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<OffsetDateTime>,
}

impl NutritionRecord {
    /// A freshly ingested `pending` record.
    pub fn new(food_name: impl Into<String>, nutrients: Nutrients) -> Self {
        Self {
            id: Uuid::new_v4(),
            food_name: food_name.into(),
            brand: None,
            category: None,
            serving_description: None,
            serving_grams: None,
            nutrients,
            status: RecordStatus::Pending,
            quality_score: 0,
            attempt_count: 0,
            review_flags: Vec::new(),
            verification_details: Vec::new(),
            last_verification: None,
            claimed_by: None,
            claimed_at: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_serving(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.serving_grams = parse_serving_grams(&description);
        self.serving_description = Some(description);
        self
    }

    /// Serving mass in grams, falling back to the import-format description.
    pub fn serving_mass(&self) -> Option<f64> {
        self.serving_grams
            .or_else(|| self.serving_description.as_deref().and_then(parse_serving_grams))
            .filter(|g| g.is_finite() && *g > 0.0)
    }

    /// Applies oracle corrections and returns what actually changed.
    pub fn apply_corrections(&mut self, fields: &FieldCorrections) -> BTreeMap<String, f64> {
        let mut changed = BTreeMap::new();
        let n = &mut self.nutrients;

        fn set(slot: &mut f64, v: Option<f64>, name: &str, changed: &mut BTreeMap<String, f64>) {
            if let Some(v) = v {
                if *slot != v {
                    *slot = v;
                    changed.insert(name.to_string(), v);
                }
            }
        }
        fn set_opt(
            slot: &mut Option<f64>,
            v: Option<f64>,
            name: &str,
            changed: &mut BTreeMap<String, f64>,
        ) {
            if let Some(v) = v {
                if *slot != Some(v) {
                    *slot = Some(v);
                    changed.insert(name.to_string(), v);
                }
            }
        }

        set(&mut n.calories, fields.calories, "calories", &mut changed);
        set(&mut n.protein_g, fields.protein_g, "protein_g", &mut changed);
        set(&mut n.carbs_g, fields.carbs_g, "carbs_g", &mut changed);
        set(&mut n.fat_g, fields.fat_g, "fat_g", &mut changed);
        set_opt(&mut n.fiber_g, fields.fiber_g, "fiber_g", &mut changed);
        set_opt(&mut n.sugar_g, fields.sugar_g, "sugar_g", &mut changed);
        set_opt(&mut n.alcohol_g, fields.alcohol_g, "alcohol_g", &mut changed);
        set_opt(&mut self.serving_grams, fields.serving_grams, "serving_grams", &mut changed);

        for (name, v) in &fields.secondary {
            if self.nutrients.secondary.get(name) != Some(v) {
                self.nutrients.secondary.insert(name.clone(), *v);
                changed.insert(name.clone(), *v);
            }
        }
        changed
    }
}

/// Reads grams out of an import-style serving description: `"100g"`, `"30 g"`,
/// `"1 cup (240g)"`.
pub fn parse_serving_grams(description: &str) -> Option<f64> {
    lazy_static! {
        static ref GRAMS_RE: Regex =
            Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:g|grams?)\b").unwrap();
    }
    GRAMS_RE
        .captures(description)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
