use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::oracle::{CorrectionOracle, OracleRequest, OracleVerdict};
use crate::records::{
    ClaimLost, NutritionRecord, RecordPatch, RecordStatus, RecordStore, VerdictKind,
    VerificationAttempt,
};
use crate::state::AppState;
use crate::validation::{review_flags, Issue, RuleBook};

/// Reason appended to `review_flags` when a record is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalFlag {
    MaxAttemptsExceeded,
    LowConfidenceConfirmation,
    OracleRuleConflict,
}

impl TerminalFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalFlag::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            TerminalFlag::LowConfidenceConfirmation => "LOW_CONFIDENCE_CONFIRMATION",
            TerminalFlag::OracleRuleConflict => "ORACLE_RULE_CONFLICT",
        }
    }
}

/// How one run of the machine left a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Verified,
    Flagged(TerminalFlag),
    /// Oracle unavailable; record left as it was for a later run.
    Deferred,
    /// Record was already terminal; nothing written.
    Unchanged,
    /// Another worker owns the record now; this run stopped without writing.
    ClaimLost,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub max_attempts: u32,
    pub confirm_threshold: f64,
    pub oracle_timeout: Duration,
}

impl Policy {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            max_attempts: state.config.verify.max_attempts,
            confirm_threshold: state.config.verify.confirm_threshold,
            oracle_timeout: state.config.oracle.timeout,
        }
    }
}

/// Quality score of a flagged record; only verified records reach 100.
pub fn flagged_quality(issues: &[Issue]) -> u8 {
    let distinct = review_flags(issues).len() as i64;
    (100 - 20 * distinct).clamp(0, 99) as u8
}

/// Per-record validate / consult / apply loop, run on behalf of one worker.
/// Every transition is written to the store before the next one starts, so a
/// run can resume from whatever the store holds. Writes only land while the
/// worker still owns the claim.
#[derive(Clone)]
pub struct VerificationMachine {
    store: Arc<dyn RecordStore>,
    oracle: Arc<dyn CorrectionOracle>,
    rules: Arc<RuleBook>,
    policy: Policy,
    worker_id: String,
}

impl VerificationMachine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        oracle: Arc<dyn CorrectionOracle>,
        rules: Arc<RuleBook>,
        policy: Policy,
        worker_id: impl Into<String>,
    ) -> Self {
        Self { store, oracle, rules, policy, worker_id: worker_id.into() }
    }

    pub fn from_state(state: &AppState, worker_id: impl Into<String>) -> Self {
        Self::new(
            state.store.clone(),
            state.oracle.clone(),
            state.rules.clone(),
            Policy::from_state(state),
            worker_id,
        )
    }

    #[instrument(skip(self, record), fields(record_id = %record.id, worker_id = %self.worker_id))]
    pub async fn run(&self, record: NutritionRecord) -> anyhow::Result<Outcome> {
        if record.status.is_terminal() {
            debug!(status = %record.status, "record already finalized");
            return Ok(Outcome::Unchanged);
        }
        if record.status != RecordStatus::Claimed
            || record.claimed_by.as_deref() != Some(self.worker_id.as_str())
        {
            warn!(owner = ?record.claimed_by, "record not claimed by this worker");
            return Ok(Outcome::ClaimLost);
        }

        match self.drive(record).await {
            Err(e) if e.downcast_ref::<ClaimLost>().is_some() => {
                warn!(error = %e, "claim lost mid-run; abandoning record");
                Ok(Outcome::ClaimLost)
            }
            other => other,
        }
    }

    async fn drive(&self, mut record: NutritionRecord) -> anyhow::Result<Outcome> {

        let threshold = self.policy.confirm_threshold;
        let mut attempt = record.attempt_count;

        loop {
            let issues = self.rules.validate(&record);
            debug!(attempt, issues = issues.len(), "validated");

            if issues.is_empty() {
                return self.finalize_verified(&mut record).await;
            }
            if attempt >= self.policy.max_attempts {
                return self
                    .finalize_flagged(&mut record, &issues, TerminalFlag::MaxAttemptsExceeded)
                    .await;
            }

            match self.consult(&record, &issues).await {
                OracleVerdict::Unavailable { reason } => {
                    warn!(attempt, %reason, "oracle unavailable; deferring record");
                    return Ok(Outcome::Deferred);
                }
                OracleVerdict::Confirmed { confidence, reasoning } if confidence < threshold => {
                    attempt += 1;
                    debug!(attempt, confidence, "low-confidence confirmation");
                    self.log_attempt(
                        &mut record,
                        attempt,
                        &issues,
                        VerdictKind::Confirmed,
                        confidence,
                        reasoning,
                        None,
                    )
                    .await?;
                    if attempt >= self.policy.max_attempts {
                        return self
                            .finalize_flagged(&mut record, &issues, TerminalFlag::LowConfidenceConfirmation)
                            .await;
                    }
                }
                OracleVerdict::Confirmed { confidence, reasoning } => {
                    // Deterministic rules decide PASS; a confident "accurate" cannot override them.
                    attempt += 1;
                    self.log_attempt(
                        &mut record,
                        attempt,
                        &issues,
                        VerdictKind::Confirmed,
                        confidence,
                        reasoning,
                        None,
                    )
                    .await?;
                    return self
                        .finalize_flagged(&mut record, &issues, TerminalFlag::OracleRuleConflict)
                        .await;
                }
                OracleVerdict::Corrected { confidence, reasoning, .. } if confidence < threshold => {
                    attempt += 1;
                    debug!(attempt, confidence, "discarding low-confidence correction");
                    self.log_attempt(
                        &mut record,
                        attempt,
                        &issues,
                        VerdictKind::Corrected,
                        confidence,
                        Some(reasoning),
                        None,
                    )
                    .await?;
                }
                OracleVerdict::Corrected { fields, reasoning, confidence } => {
                    attempt += 1;
                    let changed = record.apply_corrections(&fields);
                    debug!(attempt, confidence, changed = changed.len(), "applying correction");
                    self.log_attempt(
                        &mut record,
                        attempt,
                        &issues,
                        VerdictKind::Corrected,
                        confidence,
                        Some(reasoning),
                        Some(changed),
                    )
                    .await?;
                }
            }
        }
    }

    async fn consult(&self, record: &NutritionRecord, issues: &[Issue]) -> OracleVerdict {
        let category_bounds = record
            .category
            .as_deref()
            .map(|c| self.rules.bounds.for_category(c))
            .unwrap_or(&[]);
        let request = OracleRequest { record, issues, category_bounds };

        match tokio::time::timeout(self.policy.oracle_timeout, self.oracle.propose(request)).await {
            Ok(verdict) => verdict,
            Err(_) => OracleVerdict::unavailable(format!(
                "oracle call exceeded {:?}",
                self.policy.oracle_timeout
            )),
        }
    }

    /// Persists one counted attempt. `applied` carries the changed fields when
    /// the correction was written; the record already holds the new values.
    #[allow(clippy::too_many_arguments)]
    async fn log_attempt(
        &self,
        record: &mut NutritionRecord,
        attempt: u32,
        issues: &[Issue],
        kind: VerdictKind,
        confidence: f64,
        reasoning: Option<String>,
        applied: Option<BTreeMap<String, f64>>,
    ) -> anyhow::Result<()> {
        let entry = VerificationAttempt {
            attempt_number: attempt,
            issues_found: review_flags(issues),
            oracle_verdict_kind: kind,
            confidence,
            fields_changed: applied.clone().unwrap_or_default(),
            reasoning,
            recorded_at: OffsetDateTime::now_utc(),
        };
        let patch = RecordPatch {
            attempt_count: Some(attempt),
            nutrients: applied.as_ref().map(|_| record.nutrients.clone()),
            serving_grams: record.serving_grams,
            append_details: vec![entry],
            ..Default::default()
        };
        self.store.write(record.id, &self.worker_id, &patch).await?;
        patch.apply_to(record);
        Ok(())
    }

    async fn finalize_verified(&self, record: &mut NutritionRecord) -> anyhow::Result<Outcome> {
        let patch = RecordPatch {
            status: Some(RecordStatus::Verified),
            quality_score: Some(100),
            review_flags: Some(Vec::new()),
            last_verification: Some(OffsetDateTime::now_utc()),
            release_claim: true,
            ..Default::default()
        };
        self.store.write(record.id, &self.worker_id, &patch).await?;
        patch.apply_to(record);
        info!(attempts = record.attempt_count, "record verified");
        Ok(Outcome::Verified)
    }

    async fn finalize_flagged(
        &self,
        record: &mut NutritionRecord,
        issues: &[Issue],
        reason: TerminalFlag,
    ) -> anyhow::Result<Outcome> {
        let mut flags = review_flags(issues);
        flags.push(reason.as_str().to_string());

        let patch = RecordPatch {
            status: Some(RecordStatus::Flagged),
            quality_score: Some(flagged_quality(issues)),
            review_flags: Some(flags),
            last_verification: Some(OffsetDateTime::now_utc()),
            release_claim: true,
            ..Default::default()
        };
        self.store.write(record.id, &self.worker_id, &patch).await?;
        patch.apply_to(record);
        info!(
            attempts = record.attempt_count,
            reason = reason.as_str(),
            flags = ?record.review_flags,
            "record flagged"
        );
        Ok(Outcome::Flagged(reason))
    }
}

#[cfg(test)]
mod machine_tests {
    use super::*;
    use crate::config::VerifyConfig;
    use crate::oracle::ScriptedOracle;
    use crate::records::{FieldCorrections, MemoryStore, Nutrients};

    const WORKER: &str = "w1";

    fn vegetable() -> NutritionRecord {
        NutritionRecord::new(
            "raw broccoli",
            Nutrients { calories: 150.0, protein_g: 2.0, carbs_g: 8.0, fat_g: 12.0, ..Default::default() },
        )
        .with_category("vegetable")
    }

    fn corrected(confidence: f64, fields: FieldCorrections) -> OracleVerdict {
        OracleVerdict::Corrected { fields, reasoning: "per-100g values copied".into(), confidence }
    }

    fn confirmed(confidence: f64) -> OracleVerdict {
        OracleVerdict::Confirmed { confidence, reasoning: None }
    }

    async fn setup(record: NutritionRecord, verdicts: Vec<OracleVerdict>) -> (MemoryStore, ScriptedOracle, VerificationMachine, uuid::Uuid) {
        let store = MemoryStore::new();
        let id = store.insert(record).await;
        let oracle = ScriptedOracle::new(verdicts);
        let state = AppState::fake(store.clone(), oracle.clone());
        (store, oracle, VerificationMachine::from_state(&state, WORKER), id)
    }

    /// Claims the record for `WORKER` when it is pending, then runs it.
    async fn run(store: &MemoryStore, machine: &VerificationMachine, id: uuid::Uuid) -> Outcome {
        store.claim_pending(WORKER, 1).await.unwrap();
        let record = store.read(id).await.unwrap();
        machine.run(record).await.unwrap()
    }

    #[tokio::test]
    async fn clean_record_verifies_without_oracle() {
        let rec = NutritionRecord::new(
            "peanut butter",
            Nutrients { calories: 150.0, protein_g: 2.0, carbs_g: 8.0, fat_g: 12.0, ..Default::default() },
        );
        let (store, oracle, machine, id) = setup(rec, vec![]).await;

        assert_eq!(run(&store, &machine, id).await, Outcome::Verified);
        let r = store.get(id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Verified);
        assert_eq!(r.quality_score, 100);
        assert_eq!(r.attempt_count, 0);
        assert!(r.review_flags.is_empty());
        assert!(r.last_verification.is_some());
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn end_to_end_correction_verifies_after_one_attempt() {
        let fix = FieldCorrections { fat_g: Some(0.5), calories: Some(48.0), ..Default::default() };
        let (store, _, machine, id) = setup(vegetable(), vec![corrected(90.0, fix)]).await;

        assert_eq!(run(&store, &machine, id).await, Outcome::Verified);
        let r = store.get(id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Verified);
        assert_eq!(r.quality_score, 100);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(r.nutrients.fat_g, 0.5);
        assert_eq!(r.nutrients.calories, 48.0);
        assert!(RuleBook::default().validate(&r).is_empty());

        assert_eq!(r.verification_details.len(), 1);
        let entry = &r.verification_details[0];
        assert_eq!(entry.attempt_number, 1);
        assert_eq!(entry.oracle_verdict_kind, VerdictKind::Corrected);
        assert_eq!(entry.confidence, 90.0);
        assert_eq!(entry.issues_found, vec!["CATEGORY_OUTLIER:fat_g", "CATEGORY_OUTLIER:calories"]);
        assert_eq!(entry.fields_changed.len(), 2);
    }

    #[tokio::test]
    async fn unresolved_corrections_exhaust_the_budget() {
        let useless = || corrected(95.0, FieldCorrections { protein_g: Some(2.5), ..Default::default() });
        let (store, oracle, machine, id) =
            setup(vegetable(), vec![useless(), useless(), useless(), useless()]).await;

        assert_eq!(
            run(&store, &machine, id).await,
            Outcome::Flagged(TerminalFlag::MaxAttemptsExceeded)
        );
        let r = store.get(id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Flagged);
        assert_eq!(r.attempt_count, 3);
        assert_eq!(oracle.calls(), 3);
        assert_eq!(r.review_flags.last().map(String::as_str), Some("MAX_ATTEMPTS_EXCEEDED"));
        assert!(r.review_flags.contains(&"CATEGORY_OUTLIER:fat_g".to_string()));
        assert!(r.quality_score < 100);
        assert_eq!(r.verification_details.len(), 3);
    }

    #[tokio::test]
    async fn unavailable_oracle_leaves_record_untouched() {
        let (store, _, machine, id) =
            setup(vegetable(), vec![OracleVerdict::unavailable("connection reset")]).await;
        store.claim_pending(WORKER, 1).await.unwrap();
        let before = store.get(id).await.unwrap();

        assert_eq!(run(&store, &machine, id).await, Outcome::Deferred);
        let after = store.get(id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(after.status, RecordStatus::Claimed);
        assert_eq!(after.attempt_count, 0);
    }

    #[tokio::test]
    async fn slow_oracle_times_out_as_unavailable() {
        let store = MemoryStore::new();
        let id = store.insert(vegetable()).await;
        let oracle = ScriptedOracle::new(vec![confirmed(99.0)]).with_delay(Duration::from_millis(200));
        let state = AppState::fake(store.clone(), oracle);
        let mut policy = Policy::from_state(&state);
        policy.oracle_timeout = Duration::from_millis(20);
        let machine = VerificationMachine::new(state.store, state.oracle, state.rules, policy, WORKER);

        assert_eq!(run(&store, &machine, id).await, Outcome::Deferred);
        assert_eq!(store.get(id).await.unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn confident_confirmation_against_failing_rules_is_a_conflict() {
        let (store, _, machine, id) = setup(vegetable(), vec![confirmed(97.0)]).await;

        assert_eq!(
            run(&store, &machine, id).await,
            Outcome::Flagged(TerminalFlag::OracleRuleConflict)
        );
        let r = store.get(id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Flagged);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(
            r.review_flags,
            vec!["CATEGORY_OUTLIER:fat_g", "CATEGORY_OUTLIER:calories", "ORACLE_RULE_CONFLICT"]
        );
        assert_eq!(r.nutrients.fat_g, 12.0);
    }

    #[tokio::test]
    async fn repeated_low_confidence_confirmations_flag_at_the_limit() {
        let (store, oracle, machine, id) =
            setup(vegetable(), vec![confirmed(40.0), confirmed(50.0), confirmed(64.9)]).await;

        assert_eq!(
            run(&store, &machine, id).await,
            Outcome::Flagged(TerminalFlag::LowConfidenceConfirmation)
        );
        let r = store.get(id).await.unwrap();
        assert_eq!(r.attempt_count, 3);
        assert_eq!(oracle.calls(), 3);
        assert_eq!(r.review_flags.last().map(String::as_str), Some("LOW_CONFIDENCE_CONFIRMATION"));
        assert!(r
            .verification_details
            .iter()
            .all(|d| d.oracle_verdict_kind == VerdictKind::Confirmed && d.fields_changed.is_empty()));
    }

    #[tokio::test]
    async fn low_confidence_correction_is_discarded_then_retried() {
        let fix = FieldCorrections { fat_g: Some(0.5), calories: Some(48.0), ..Default::default() };
        let (store, _, machine, id) =
            setup(vegetable(), vec![corrected(30.0, fix.clone()), corrected(80.0, fix)]).await;

        assert_eq!(run(&store, &machine, id).await, Outcome::Verified);
        let r = store.get(id).await.unwrap();
        assert_eq!(r.attempt_count, 2);
        assert!(r.verification_details[0].fields_changed.is_empty());
        assert_eq!(r.verification_details[1].fields_changed["fat_g"], 0.5);
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let fix = FieldCorrections { fat_g: Some(0.5), calories: Some(48.0), ..Default::default() };
        let (store, _, machine, id) = setup(vegetable(), vec![corrected(65.0, fix)]).await;
        assert_eq!(run(&store, &machine, id).await, Outcome::Verified);
        assert_eq!(store.get(id).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_from_persisted_attempts() {
        let useless = || corrected(95.0, FieldCorrections { protein_g: Some(3.0), ..Default::default() });
        let (store, oracle, machine, id) = setup(
            vegetable(),
            vec![useless(), OracleVerdict::unavailable("timeout"), useless(), useless()],
        )
        .await;

        assert_eq!(run(&store, &machine, id).await, Outcome::Deferred);
        assert_eq!(store.get(id).await.unwrap().attempt_count, 1);

        assert_eq!(
            run(&store, &machine, id).await,
            Outcome::Flagged(TerminalFlag::MaxAttemptsExceeded)
        );
        let r = store.get(id).await.unwrap();
        assert_eq!(r.attempt_count, 3);
        assert_eq!(oracle.calls(), 4);
        let numbers: Vec<u32> = r.verification_details.iter().map(|d| d.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rerunning_a_verified_record_is_a_noop() {
        let fix = FieldCorrections { fat_g: Some(0.5), calories: Some(48.0), ..Default::default() };
        let (store, oracle, machine, id) = setup(vegetable(), vec![corrected(90.0, fix)]).await;
        run(&store, &machine, id).await;
        let before = store.get(id).await.unwrap();

        assert_eq!(run(&store, &machine, id).await, Outcome::Unchanged);
        assert_eq!(store.get(id).await.unwrap(), before);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn record_at_budget_is_flagged_without_consulting() {
        let mut rec = vegetable();
        rec.attempt_count = 3;
        let (store, oracle, machine, id) = setup(rec, vec![confirmed(99.0)]).await;

        assert_eq!(
            run(&store, &machine, id).await,
            Outcome::Flagged(TerminalFlag::MaxAttemptsExceeded)
        );
        assert_eq!(oracle.calls(), 0);
        assert_eq!(store.get(id).await.unwrap().attempt_count, 3);
    }

    #[tokio::test]
    async fn custom_budget_is_honoured() {
        let store = MemoryStore::new();
        let id = store.insert(vegetable()).await;
        let oracle = ScriptedOracle::new(vec![confirmed(10.0)]);
        let state = AppState::fake_with(
            store.clone(),
            oracle,
            VerifyConfig { max_attempts: 1, ..Default::default() },
        );
        let machine = VerificationMachine::from_state(&state, WORKER);

        assert_eq!(
            run(&store, &machine, id).await,
            Outcome::Flagged(TerminalFlag::LowConfidenceConfirmation)
        );
        assert_eq!(store.get(id).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn record_owned_by_another_worker_is_not_touched() {
        let (store, oracle, machine, id) = setup(vegetable(), vec![confirmed(99.0)]).await;
        store.claim_pending("w2", 1).await.unwrap();
        let before = store.get(id).await.unwrap();

        assert_eq!(machine.run(before.clone()).await.unwrap(), Outcome::ClaimLost);
        assert_eq!(store.get(id).await.unwrap(), before);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn stale_worker_cannot_overwrite_the_new_owner() {
        let useless = || corrected(95.0, FieldCorrections { protein_g: Some(2.5), ..Default::default() });
        let store = MemoryStore::new();
        let id = store.insert(vegetable()).await;
        let state = AppState::fake(store.clone(), ScriptedOracle::default());
        let policy = Policy::from_state(&state);

        store.claim_pending("w1", 1).await.unwrap();
        let slow = ScriptedOracle::new(vec![useless()]).with_delay(Duration::from_millis(300));
        let first = VerificationMachine::new(
            state.store.clone(),
            Arc::new(slow),
            state.rules.clone(),
            policy,
            "w1",
        );
        let record = store.read(id).await.unwrap();
        let first_run = tokio::spawn(async move { first.run(record).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.sweep_stale_claims(Duration::ZERO).await.unwrap(), 1);
        store.claim_pending("w2", 1).await.unwrap();
        let second = VerificationMachine::new(
            state.store.clone(),
            Arc::new(ScriptedOracle::new(vec![
                useless(),
                useless(),
                OracleVerdict::unavailable("rate limited"),
            ])),
            state.rules.clone(),
            policy,
            "w2",
        );
        let record = store.read(id).await.unwrap();
        assert_eq!(second.run(record).await.unwrap(), Outcome::Deferred);
        assert_eq!(store.get(id).await.unwrap().attempt_count, 2);

        assert_eq!(first_run.await.unwrap().unwrap(), Outcome::ClaimLost);
        let r = store.get(id).await.unwrap();
        assert_eq!(r.attempt_count, 2);
        assert_eq!(r.claimed_by.as_deref(), Some("w2"));
        let numbers: Vec<u32> = r.verification_details.iter().map(|d| d.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn flagged_quality_never_reaches_100() {
        let one = [Issue::SugarExceedsCarbs { sugar_g: 2.0, carbs_g: 1.0 }];
        assert_eq!(flagged_quality(&one), 80);
        assert_eq!(flagged_quality(&[]), 99);
        let many: Vec<Issue> = (0..7)
            .map(|i| Issue::NegativeValue { field: format!("n{i}"), value: -1.0 })
            .collect();
        assert_eq!(flagged_quality(&many), 0);
    }
}
