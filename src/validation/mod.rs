pub mod bounds;
pub mod rules;

pub use bounds::{Bound, CategoryBounds};
pub use rules::{computed_energy, review_flags, Issue, IssueCode, RuleBook};
