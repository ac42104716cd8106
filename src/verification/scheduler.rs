use std::time::Duration;

use futures::future;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, instrument};

use super::services::{run_batch_until, BatchSummary};
use crate::state::AppState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationSummary {
    /// Stale claims returned to `pending` before the run.
    pub swept: u64,
    pub workers: usize,
    #[serde(flatten)]
    pub totals: BatchSummary,
}

/// `prefix-0`, `prefix-1`, ...
pub fn worker_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-{i}")).collect()
}

/// One scheduled invocation: sweep stale claims, then run every worker
/// identity's batch in parallel under the configured time budget.
#[instrument(skip(state, worker_ids), fields(workers = worker_ids.len()))]
pub async fn run_invocation(
    state: &AppState,
    worker_ids: &[String],
    batch_size: usize,
) -> InvocationSummary {
    let cfg = &state.config.verify;
    let deadline = Instant::now() + cfg.time_budget;

    let swept = match state.store.sweep_stale_claims(cfg.stale_after).await {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "stale-claim sweep failed");
            0
        }
    };

    let jitter = if worker_ids.len() > 1 { cfg.start_jitter } else { Duration::ZERO };
    let runs = worker_ids.iter().map(|worker_id| async move {
        if !jitter.is_zero() {
            let ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        run_batch_until(state, worker_id, batch_size, Some(deadline)).await
    });

    let mut totals = BatchSummary::default();
    for summary in future::join_all(runs).await {
        totals += summary;
    }

    info!(
        swept,
        verified = totals.verified,
        flagged = totals.flagged,
        skipped = totals.skipped,
        "invocation finished"
    );
    InvocationSummary { swept, workers: worker_ids.len(), totals }
}

/// Runs an invocation every `VERIFY_INTERVAL_SECS` when configured.
pub fn spawn_interval(state: AppState) -> Option<JoinHandle<()>> {
    let period = state.config.verify.interval?;
    let ids = worker_ids(&state.config.verify.worker_prefix, state.config.verify.workers);
    let batch_size = state.config.verify.batch_size;

    info!(?period, workers = ids.len(), batch_size, "in-process schedule enabled");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            run_invocation(&state, &ids, batch_size).await;
        }
    }))
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;
    use crate::config::VerifyConfig;
    use crate::oracle::ScriptedOracle;
    use crate::records::{MemoryStore, NutritionRecord, Nutrients, RecordStatus, RecordStore};

    fn clean(i: usize) -> NutritionRecord {
        NutritionRecord::new(
            format!("food-{i}"),
            Nutrients { calories: 40.0, carbs_g: 10.0, ..Default::default() },
        )
    }

    #[test]
    fn worker_ids_are_numbered() {
        assert_eq!(worker_ids("verifier", 3), vec!["verifier-0", "verifier-1", "verifier-2"]);
        assert!(worker_ids("x", 0).is_empty());
    }

    #[tokio::test]
    async fn invocation_sweeps_then_fans_out() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.insert(clean(i)).await;
        }
        // A crashed run left three records claimed.
        store.claim_pending("dead-worker", 3).await.unwrap();

        let verify = VerifyConfig {
            stale_after: Duration::ZERO,
            start_jitter: Duration::from_millis(5),
            ..Default::default()
        };
        let state = AppState::fake_with(store.clone(), ScriptedOracle::default(), verify);

        let summary = run_invocation(&state, &worker_ids("v", 3), 10).await;
        assert_eq!(summary.swept, 3);
        assert_eq!(summary.workers, 3);
        assert_eq!(summary.totals.verified, 25);
        assert_eq!(store.count_with_status(RecordStatus::Verified).await, 25);
    }

    #[tokio::test]
    async fn fresh_claims_survive_the_sweep() {
        let store = MemoryStore::new();
        for i in 0..4 {
            store.insert(clean(i)).await;
        }
        store.claim_pending("busy-worker", 2).await.unwrap();
        let state = AppState::fake(store.clone(), ScriptedOracle::default());

        let summary = run_invocation(&state, &worker_ids("v", 1), 10).await;
        assert_eq!(summary.swept, 0);
        assert_eq!(summary.totals.verified, 2);
        assert_eq!(store.count_with_status(RecordStatus::Claimed).await, 2);
    }

    #[test]
    fn summary_serializes_flat() {
        let s = InvocationSummary {
            swept: 1,
            workers: 2,
            totals: BatchSummary { verified: 3, flagged: 4, skipped: 5 },
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["verified"], 3);
        assert_eq!(v["skipped"], 5);
        assert_eq!(v["swept"], 1);
    }
}
