//! Validation and automatic correction of nutrition catalog records.
//!
//! Pending records are claimed in batches, checked against deterministic
//! rules, corrected through an external oracle when possible, and finalized as
//! `verified` or `flagged`.

pub mod app;
pub mod config;
pub mod db;
pub mod oracle;
pub mod records;
pub mod state;
pub mod validation;
pub mod verification;
