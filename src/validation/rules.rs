use std::fmt;

use serde::Serialize;

use super::bounds::CategoryBounds;
use crate::records::{NutrientField, NutritionRecord};

pub const KCAL_PER_G_PROTEIN: f64 = 4.0;
pub const KCAL_PER_G_CARBS: f64 = 4.0;
pub const KCAL_PER_G_FAT: f64 = 9.0;
pub const KCAL_PER_G_ALCOHOL: f64 = 7.0;

pub const DEFAULT_ENERGY_TOLERANCE: f64 = 0.20;

// Absorbs float noise when comparing gram sums.
const MASS_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    EnergyMismatch,
    MassExceedsServing,
    CategoryOutlier,
    SugarExceedsCarbs,
    FiberExceedsCarbs,
    NegativeValue,
    NonFiniteValue,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::EnergyMismatch => "ENERGY_MISMATCH",
            IssueCode::MassExceedsServing => "MASS_EXCEEDS_SERVING",
            IssueCode::CategoryOutlier => "CATEGORY_OUTLIER",
            IssueCode::SugarExceedsCarbs => "SUGAR_EXCEEDS_CARBS",
            IssueCode::FiberExceedsCarbs => "FIBER_EXCEEDS_CARBS",
            IssueCode::NegativeValue => "NEGATIVE_VALUE",
            IssueCode::NonFiniteValue => "NON_FINITE_VALUE",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deterministic rule failure together with the values that tripped it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Issue {
    EnergyMismatch {
        stated_kcal: f64,
        computed_kcal: f64,
        /// `None` when the stated energy is zero or negative.
        relative_diff: Option<f64>,
    },
    MassExceedsServing {
        macro_grams: f64,
        serving_grams: f64,
    },
    CategoryOutlier {
        category: String,
        field: NutrientField,
        value_per_100g: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
    SugarExceedsCarbs {
        sugar_g: f64,
        carbs_g: f64,
    },
    FiberExceedsCarbs {
        fiber_g: f64,
        carbs_g: f64,
    },
    NegativeValue {
        field: String,
        value: f64,
    },
    /// NaN or infinite; serialized as `null`.
    NonFiniteValue {
        field: String,
        value: f64,
    },
}

impl Issue {
    pub fn code(&self) -> IssueCode {
        match self {
            Issue::EnergyMismatch { .. } => IssueCode::EnergyMismatch,
            Issue::MassExceedsServing { .. } => IssueCode::MassExceedsServing,
            Issue::CategoryOutlier { .. } => IssueCode::CategoryOutlier,
            Issue::SugarExceedsCarbs { .. } => IssueCode::SugarExceedsCarbs,
            Issue::FiberExceedsCarbs { .. } => IssueCode::FiberExceedsCarbs,
            Issue::NegativeValue { .. } => IssueCode::NegativeValue,
            Issue::NonFiniteValue { .. } => IssueCode::NonFiniteValue,
        }
    }

    /// Review flag text. Outliers and invalid values carry the field so that
    /// two different offending fields stay distinguishable.
    pub fn flag(&self) -> String {
        match self {
            Issue::CategoryOutlier { field, .. } => format!("{}:{}", self.code(), field),
            Issue::NegativeValue { field, .. } | Issue::NonFiniteValue { field, .. } => {
                format!("{}:{}", self.code(), field)
            }
            _ => self.code().as_str().to_string(),
        }
    }

    /// One-line human description, used in oracle prompts.
    pub fn describe(&self) -> String {
        match self {
            Issue::EnergyMismatch { stated_kcal, computed_kcal, relative_diff } => match relative_diff {
                Some(d) => format!(
                    "stated energy {stated_kcal:.1} kcal differs from macro-derived {computed_kcal:.1} kcal by {:.1}%",
                    d * 100.0
                ),
                None => format!("stated energy is {stated_kcal:.1} kcal but macros imply {computed_kcal:.1} kcal"),
            },
            Issue::MassExceedsServing { macro_grams, serving_grams } => format!(
                "protein + carbohydrate + fat total {macro_grams:.1} g, more than the {serving_grams:.1} g serving"
            ),
            Issue::CategoryOutlier { category, field, value_per_100g, min, max } => {
                let range = match (min, max) {
                    (Some(lo), Some(hi)) => format!("{lo}..{hi}"),
                    (Some(lo), None) => format!(">= {lo}"),
                    (None, Some(hi)) => format!("<= {hi}"),
                    (None, None) => "any".to_string(),
                };
                format!("{field} of {value_per_100g:.1} per 100 g is outside the {category} range {range}")
            }
            Issue::SugarExceedsCarbs { sugar_g, carbs_g } => {
                format!("sugar {sugar_g:.1} g exceeds total carbohydrate {carbs_g:.1} g")
            }
            Issue::FiberExceedsCarbs { fiber_g, carbs_g } => {
                format!("fiber {fiber_g:.1} g exceeds total carbohydrate {carbs_g:.1} g")
            }
            Issue::NegativeValue { field, value } => format!("{field} is negative ({value})"),
            Issue::NonFiniteValue { field, value } => format!("{field} is not a finite number ({value})"),
        }
    }
}

/// Ordered, de-duplicated review flags for a set of issues.
pub fn review_flags(issues: &[Issue]) -> Vec<String> {
    let mut flags: Vec<String> = Vec::with_capacity(issues.len());
    for issue in issues {
        let flag = issue.flag();
        if !flags.contains(&flag) {
            flags.push(flag);
        }
    }
    flags
}

/// The deterministic validator: pure, no I/O.
#[derive(Debug, Clone)]
pub struct RuleBook {
    pub energy_tolerance: f64,
    pub bounds: CategoryBounds,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self {
            energy_tolerance: DEFAULT_ENERGY_TOLERANCE,
            bounds: CategoryBounds::builtin(),
        }
    }
}

impl RuleBook {
    pub fn new(energy_tolerance: f64, bounds: CategoryBounds) -> Self {
        Self { energy_tolerance, bounds }
    }

    /// Runs every rule, in a fixed order, without short-circuiting.
    pub fn validate(&self, record: &NutritionRecord) -> Vec<Issue> {
        let mut issues = Vec::new();
        issues.extend(self.check_energy(record));
        issues.extend(check_mass(record));
        issues.extend(self.check_category(record));
        issues.extend(check_components(record));
        issues
    }

    fn check_energy(&self, record: &NutritionRecord) -> Option<Issue> {
        let n = &record.nutrients;
        let stated = n.calories;
        let computed = computed_energy(record);

        if stated <= 0.0 {
            return (computed > 0.0).then_some(Issue::EnergyMismatch {
                stated_kcal: stated,
                computed_kcal: computed,
                relative_diff: None,
            });
        }

        let diff = (computed - stated).abs() / stated;
        (diff > self.energy_tolerance).then_some(Issue::EnergyMismatch {
            stated_kcal: stated,
            computed_kcal: computed,
            relative_diff: Some(diff),
        })
    }

    fn check_category(&self, record: &NutritionRecord) -> Vec<Issue> {
        let Some(category) = record.category.as_deref() else {
            return Vec::new();
        };
        let serving = record.serving_mass();

        self.bounds
            .for_category(category)
            .iter()
            .filter_map(|bound| {
                let value = record.nutrients.get(bound.field)?;
                let per_100g = serving.map_or(value, |g| value * 100.0 / g);
                (!bound.contains(per_100g)).then(|| Issue::CategoryOutlier {
                    category: category.trim().to_lowercase(),
                    field: bound.field,
                    value_per_100g: per_100g,
                    min: bound.min,
                    max: bound.max,
                })
            })
            .collect()
    }
}

/// Atwater energy from the declared macros.
pub fn computed_energy(record: &NutritionRecord) -> f64 {
    let n = &record.nutrients;
    KCAL_PER_G_PROTEIN * n.protein_g
        + KCAL_PER_G_CARBS * n.carbs_g
        + KCAL_PER_G_FAT * n.fat_g
        + KCAL_PER_G_ALCOHOL * n.alcohol_g.unwrap_or(0.0)
}

fn check_mass(record: &NutritionRecord) -> Option<Issue> {
    let serving = record.serving_mass()?;
    let n = &record.nutrients;
    let total = n.protein_g + n.carbs_g + n.fat_g + n.alcohol_g.unwrap_or(0.0);

    (total > serving + MASS_EPSILON).then_some(Issue::MassExceedsServing {
        macro_grams: total,
        serving_grams: serving,
    })
}

fn check_components(record: &NutritionRecord) -> Vec<Issue> {
    let n = &record.nutrients;
    let mut issues = Vec::new();

    if let Some(sugar) = n.sugar_g {
        if sugar > n.carbs_g + MASS_EPSILON {
            issues.push(Issue::SugarExceedsCarbs { sugar_g: sugar, carbs_g: n.carbs_g });
        }
    }
    if let Some(fiber) = n.fiber_g {
        if fiber > n.carbs_g + MASS_EPSILON {
            issues.push(Issue::FiberExceedsCarbs { fiber_g: fiber, carbs_g: n.carbs_g });
        }
    }

    let primary = [
        NutrientField::Calories,
        NutrientField::ProteinG,
        NutrientField::CarbsG,
        NutrientField::FatG,
        NutrientField::FiberG,
        NutrientField::SugarG,
        NutrientField::AlcoholG,
    ];
    let invalid = primary
        .into_iter()
        .filter_map(|f| n.get(f).map(|v| (f.as_str().to_string(), v)))
        .chain(record.serving_grams.map(|g| ("serving_grams".to_string(), g)))
        .chain(n.secondary.iter().map(|(k, v)| (k.clone(), *v)))
        .filter_map(|(field, value)| {
            if !value.is_finite() {
                Some(Issue::NonFiniteValue { field, value })
            } else if value < 0.0 {
                Some(Issue::NegativeValue { field, value })
            } else {
                None
            }
        });
    issues.extend(invalid);

    issues
}
