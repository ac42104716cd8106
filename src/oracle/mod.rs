pub mod client;
mod dto;
pub mod prompt;
pub mod scripted;

use async_trait::async_trait;
use serde::Serialize;

use crate::records::{FieldCorrections, NutritionRecord, VerdictKind};
use crate::validation::{Bound, Issue};

pub use client::{ChatCompletionOracle, OracleError};
pub use scripted::ScriptedOracle;

/// What the correction service said about a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum OracleVerdict {
    /// Current values are accurate.
    Confirmed {
        confidence: f64,
        reasoning: Option<String>,
    },
    /// Replacement values for a subset of fields.
    Corrected {
        fields: FieldCorrections,
        reasoning: String,
        confidence: f64,
    },
    /// Transport, timeout or parse failure. Never counts as an attempt.
    Unavailable { reason: String },
}

impl OracleVerdict {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        OracleVerdict::Unavailable { reason: reason.into() }
    }

    pub fn kind(&self) -> Option<VerdictKind> {
        match self {
            OracleVerdict::Confirmed { .. } => Some(VerdictKind::Confirmed),
            OracleVerdict::Corrected { .. } => Some(VerdictKind::Corrected),
            OracleVerdict::Unavailable { .. } => None,
        }
    }
}

/// Everything the oracle is shown for one consultation.
#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    pub record: &'a NutritionRecord,
    pub issues: &'a [Issue],
    /// Configured bounds for the record's category, if any.
    pub category_bounds: &'a [Bound],
}

/// Proposes corrections; never mutates the record. Calls are side-effect free
/// so callers may repeat them.
#[async_trait]
pub trait CorrectionOracle: Send + Sync {
    async fn propose(&self, request: OracleRequest<'_>) -> OracleVerdict;
}
