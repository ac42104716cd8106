pub mod memory;
pub mod model;
pub mod repo;
mod repo_types;
pub mod store;

pub use memory::MemoryStore;
pub use model::{
    FieldCorrections, NutrientField, NutritionRecord, Nutrients, RecordRef, RecordStatus,
    VerdictKind, VerificationAttempt,
};
pub use repo::PgRecordStore;
pub use store::{ClaimLost, RecordPatch, RecordStore};
