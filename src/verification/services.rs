use std::ops::AddAssign;

use futures::{future, stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::machine::{Outcome, VerificationMachine};
use crate::records::RecordRef;
use crate::state::AppState;

/// Aggregate counts handed back to whoever scheduled the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub verified: usize,
    pub flagged: usize,
    /// Claimed but not finalized: deferred, failed, claim lost, or cut off by
    /// the deadline.
    pub skipped: usize,
}

impl AddAssign for BatchSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.verified += rhs.verified;
        self.flagged += rhs.flagged;
        self.skipped += rhs.skipped;
    }
}

pub async fn run_batch(state: &AppState, worker_id: &str, batch_size: usize) -> BatchSummary {
    run_batch_until(state, worker_id, batch_size, None).await
}

/// Claims up to `batch_size` pending records and runs each through the state
/// machine concurrently. Records still in flight at `deadline` are abandoned
/// in `claimed` state for the stale sweep.
#[instrument(skip(state, deadline))]
pub async fn run_batch_until(
    state: &AppState,
    worker_id: &str,
    batch_size: usize,
    deadline: Option<Instant>,
) -> BatchSummary {
    let refs = match state.store.claim_pending(worker_id, batch_size).await {
        Ok(refs) => refs,
        Err(e) => {
            error!(error = %e, "claim failed");
            return BatchSummary::default();
        }
    };
    if refs.is_empty() {
        debug!("nothing to claim");
        return BatchSummary::default();
    }

    let claimed = refs.len();
    let machine = VerificationMachine::from_state(state, worker_id);

    let cutoff = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => future::pending::<()>().await,
        }
    };

    let outcomes: Vec<Option<Outcome>> = stream::iter(refs)
        .map(|r| process_record(state, &machine, r))
        .buffer_unordered(claimed)
        .take_until(cutoff)
        .collect()
        .await;

    if outcomes.len() < claimed {
        warn!(
            finished = outcomes.len(),
            abandoned = claimed - outcomes.len(),
            "batch deadline reached"
        );
    }

    let mut summary = BatchSummary::default();
    for outcome in outcomes.iter().flatten() {
        match outcome {
            Outcome::Verified => summary.verified += 1,
            Outcome::Flagged(_) => summary.flagged += 1,
            Outcome::Deferred | Outcome::Unchanged | Outcome::ClaimLost => {}
        }
    }
    summary.skipped = claimed - summary.verified - summary.flagged;

    info!(
        claimed,
        verified = summary.verified,
        flagged = summary.flagged,
        skipped = summary.skipped,
        "batch finished"
    );
    summary
}

/// One record, isolated: its failure is logged and never reaches the batch.
async fn process_record(
    state: &AppState,
    machine: &VerificationMachine,
    r: RecordRef,
) -> Option<Outcome> {
    let record = match state.store.read(r.id).await {
        Ok(record) => record,
        Err(e) => {
            error!(record_id = %r.id, error = %e, "read failed");
            return None;
        }
    };

    match machine.run(record).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(record_id = %r.id, error = %e, "verification failed; record left for retry");
            None
        }
    }
}
