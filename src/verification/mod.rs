mod dto;
pub mod handlers;
pub mod machine;
pub mod scheduler;
pub mod services;

use crate::state::AppState;
use axum::Router;

pub use machine::{Outcome, Policy, TerminalFlag, VerificationMachine};
pub use scheduler::{run_invocation, spawn_interval, worker_ids, InvocationSummary};
pub use services::{run_batch, run_batch_until, BatchSummary};

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::run_routes())
}
