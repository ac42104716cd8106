use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::records::NutrientField;

/// Plausible range for one field, per 100 g of food.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub field: NutrientField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bound {
    fn max(field: NutrientField, max: f64) -> Self {
        Self { field, min: None, max: Some(max) }
    }

    fn min(field: NutrientField, min: f64) -> Self {
        Self { field, min: Some(min), max: None }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

/// Category -> bounds table. Lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryBounds {
    categories: BTreeMap<String, Vec<Bound>>,
}

impl CategoryBounds {
    pub fn builtin() -> Self {
        use NutrientField::*;

        let table = [
            ("vegetable", vec![Bound::max(FatG, 1.0), Bound::max(Calories, 100.0)]),
            ("fruit", vec![Bound::max(ProteinG, 5.0), Bound::max(Calories, 350.0)]),
            ("oil", vec![Bound::max(ProteinG, 1.0), Bound::max(CarbsG, 1.0), Bound::min(Calories, 700.0)]),
            ("meat", vec![Bound::max(CarbsG, 5.0), Bound::max(FiberG, 1.0)]),
            ("fish", vec![Bound::max(CarbsG, 5.0), Bound::max(FiberG, 1.0)]),
            ("dairy", vec![Bound::max(FiberG, 1.0), Bound::max(ProteinG, 40.0)]),
            ("beverage", vec![Bound::max(FatG, 10.0), Bound::max(Calories, 250.0)]),
            ("grain", vec![Bound::max(FatG, 25.0), Bound::max(ProteinG, 30.0)]),
        ];

        Self {
            categories: table
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let parsed: BTreeMap<String, Vec<Bound>> =
            serde_json::from_str(raw).context("parse category bounds")?;

        let mut categories = BTreeMap::new();
        for (name, bounds) in parsed {
            for b in &bounds {
                if let (Some(lo), Some(hi)) = (b.min, b.max) {
                    anyhow::ensure!(lo <= hi, "category `{name}`: {} min {lo} > max {hi}", b.field);
                }
            }
            categories.insert(normalize(&name), bounds);
        }
        Ok(Self { categories })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read category bounds {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn for_category(&self, category: &str) -> &[Bound] {
        self.categories
            .get(&normalize(category))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

fn normalize(category: &str) -> String {
    category.trim().to_lowercase()
}
