//! Recovery Orchestrator: the only component that drives the other five
//!
//! One `recover` call walks a failure through
//! Assessment → StrategySelection → Execution → Validation and ends in
//! Completion or Failure. Every run, successful or not, leaves a `Recovery`
//! entry in the history ledger.
//!
//! # Plan selection (first match wins)
//!
//! | Condition                                                  | Plan               | Priority |
//! |------------------------------------------------------------|--------------------|----------|
//! | loop detected or breaker open                              | BreakLoop          | 10       |
//! | level ≥ HumanIntervention, Critical, or ≥ 3 prior attempts | Escalate           | 8        |
//! | snapshot available and retry count ≥ 2                     | Rollback, Retry    | 6        |
//! | retryable                                                  | Retry              | 3        |
//! | any prior attempts                                         | Hybrid             | 5        |
//! | otherwise                                                  | Escalate           | 2        |
//!
//! Runs for the same agent/task pair are serialized; different pairs
//! recover in parallel. Infrastructure errors inside a run never reach the
//! caller: they end the run with an emergency escalation ticket.

mod execution;
pub mod phase;
pub mod selection;
pub mod stats;

pub use phase::{PhaseTracker, PhaseTransition};
pub use selection::{flatten, select_tactics, Assessment, Selection};
pub use stats::OrchestratorStats;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::error::OpResult;
use crate::escalation::{
    EscalationDesk, EscalationTicket, LogNotifier, Notifier, QueueReport, TicketFilter,
};
use crate::history::{EntryKind, HistoryEntry, HistoryLedger, HistoryQuery};
use crate::loop_detect::{LoopDetector, ObservedAction};
use crate::retry::{RecoveryCallback, RetryPlanner};
use crate::snapshot::SnapshotStore;
use crate::storage::SharedStore;
use crate::types::{
    FailureRecord, RecoveryPhase, RecoveryPlan, RecoveryResult, Tactic, TacticKind, TacticOutcome,
};

/// Look-back for interventions counted during assessment
const INTERVENTION_WINDOW_HOURS: i64 = 24;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Mutable state of one in-flight recovery
pub(crate) struct RecoveryRun {
    recovery_id: String,
    failure: FailureRecord,
    phases: PhaseTracker,
    assessment: Option<Assessment>,
    plan: RecoveryPlan,
    trace: Vec<TacticOutcome>,
    restored_state: Option<serde_json::Value>,
    ticket_id: Option<String>,
    success: bool,
    error: Option<String>,
}

impl RecoveryRun {
    fn new(failure: FailureRecord) -> Self {
        Self {
            recovery_id: uuid::Uuid::new_v4().to_string(),
            plan: RecoveryPlan::new(failure.id.clone(), Vec::new(), 0),
            failure,
            phases: PhaseTracker::new(),
            assessment: None,
            trace: Vec::new(),
            restored_state: None,
            ticket_id: None,
            success: false,
            error: None,
        }
    }

    fn attempts(&self) -> u32 {
        self.trace.iter().map(|o| o.attempts.len() as u32).sum()
    }

    fn outcome_phase(&self) -> RecoveryPhase {
        if self.success {
            RecoveryPhase::Completion
        } else {
            RecoveryPhase::Failure
        }
    }

    fn history_record(&self) -> serde_json::Value {
        json!({
            "recovery_id": self.recovery_id,
            "failure": self.failure,
            "assessment": self.assessment,
            "plan": self.plan,
            "tactics_tried": self.trace.iter().map(|o| o.tactic).collect::<Vec<_>>(),
            "trace": self.trace,
            "phases": self.phases.transitions(),
            "attempts": self.attempts(),
            "success": self.success,
            "final_phase": self.outcome_phase(),
            "escalation_ticket_id": self.ticket_id,
            "duration_ms": self.phases.elapsed_ms(),
            "error": self.error,
        })
    }

    fn into_result(self) -> RecoveryResult {
        RecoveryResult {
            attempts: self.attempts(),
            duration_ms: self.phases.elapsed_ms(),
            final_phase: self.phases.current(),
            tactics_tried: self.trace.iter().map(|o| o.tactic).collect(),
            recovery_id: self.recovery_id,
            failure_id: self.failure.id,
            success: self.success,
            plan: self.plan,
            trace: self.trace,
            escalation_ticket_id: self.ticket_id,
            restored_state: self.restored_state,
            error: self.error,
        }
    }
}

/// The Recovery Orchestrator
pub struct RecoveryOrchestrator {
    retry: RetryPlanner,
    snapshots: SnapshotStore,
    loop_detector: LoopDetector,
    escalations: EscalationDesk,
    history: HistoryLedger,
    locks: DashMap<(String, String), KeyLock>,
    stats: Mutex<OrchestratorStats>,
}

impl RecoveryOrchestrator {
    /// Build all components over one store, logging escalations only
    pub fn new(store: SharedStore, config: RecoveryConfig) -> OpResult<Self> {
        Self::with_notifier(store, config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        store: SharedStore,
        config: RecoveryConfig,
        notifier: Arc<dyn Notifier>,
    ) -> OpResult<Self> {
        config.validate()?;
        let RecoveryConfig {
            retry,
            snapshot,
            loop_detection,
            escalation,
            history,
        } = config;
        Ok(Self {
            retry: RetryPlanner::with_config(retry),
            snapshots: SnapshotStore::new(store.clone(), snapshot),
            loop_detector: LoopDetector::new(store.clone(), loop_detection),
            escalations: EscalationDesk::with_notifier(store.clone(), escalation, notifier),
            history: HistoryLedger::new(store, history),
            locks: DashMap::new(),
            stats: Mutex::new(OrchestratorStats::default()),
        })
    }

    pub fn retry_planner(&self) -> &RetryPlanner {
        &self.retry
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn loop_detector(&self) -> &LoopDetector {
        &self.loop_detector
    }

    pub fn escalations(&self) -> &EscalationDesk {
        &self.escalations
    }

    pub fn history(&self) -> &HistoryLedger {
        &self.history
    }

    fn stats_guard(&self) -> MutexGuard<'_, OrchestratorStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats_guard().clone()
    }

    fn key_lock(&self, key: &(String, String)) -> KeyLock {
        self.locks.entry(key.clone()).or_default().value().clone()
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Recover from `failure` with no deadline
    pub async fn recover(
        &self,
        failure: FailureRecord,
        callback: &dyn RecoveryCallback,
    ) -> RecoveryResult {
        self.recover_with_deadline(failure, callback, None).await
    }

    /// Recover, giving up on retries once `timeout` has elapsed
    pub async fn recover_with_timeout(
        &self,
        failure: FailureRecord,
        callback: &dyn RecoveryCallback,
        timeout: Duration,
    ) -> RecoveryResult {
        self.recover_with_deadline(failure, callback, Some(Instant::now() + timeout))
            .await
    }

    /// Full recovery run.
    ///
    /// Blocks while another run for the same agent/task pair is in flight.
    /// If `deadline` passes, the current Retry step is abandoned as failed
    /// and, when nothing else succeeded, an emergency ticket is opened.
    pub async fn recover_with_deadline(
        &self,
        failure: FailureRecord,
        callback: &dyn RecoveryCallback,
        deadline: Option<Instant>,
    ) -> RecoveryResult {
        let key = (failure.agent_id.clone(), failure.task_id.clone());
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.run(failure, callback, deadline).await
        };
        drop(lock);
        // Only the map's own handle left means nobody is waiting
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        self.stats_guard().record(&result);
        result
    }

    async fn run(
        &self,
        failure: FailureRecord,
        callback: &dyn RecoveryCallback,
        deadline: Option<Instant>,
    ) -> RecoveryResult {
        let mut run = RecoveryRun::new(failure);
        info!(
            recovery_id = %run.recovery_id,
            agent_id = %run.failure.agent_id,
            task_id = %run.failure.task_id,
            kind = %run.failure.kind,
            severity = %run.failure.severity,
            "Recovery started"
        );

        if let Err(e) = self.drive(&mut run, callback, deadline).await {
            let phase = run.phases.current();
            error!(
                recovery_id = %run.recovery_id,
                agent_id = %run.failure.agent_id,
                phase = %phase,
                error = %e,
                "Recovery aborted"
            );
            run.success = false;
            run.error = Some(e.to_string());
            self.emergency(&mut run, &format!("recovery aborted during {}: {}", phase, e))
                .await;
        } else if !run.success && run.ticket_id.is_none() {
            let failed_escalation = run
                .trace
                .iter()
                .find(|o| o.tactic == TacticKind::Escalate && !o.success)
                .map(|o| o.detail.clone());
            if deadline_passed(deadline) {
                self.emergency(&mut run, "recovery deadline exceeded").await;
            } else if let Some(detail) = failed_escalation {
                self.emergency(&mut run, &format!("escalation failed: {}", detail))
                    .await;
            }
        }

        if let Err(e) = self.history.append(
            &run.failure.agent_id,
            &run.failure.task_id,
            EntryKind::Recovery,
            run.history_record(),
            HashMap::from([
                ("priority".to_string(), json!(run.plan.priority)),
                ("failure_kind".to_string(), json!(run.failure.kind)),
            ]),
        ) {
            error!(
                recovery_id = %run.recovery_id,
                agent_id = %run.failure.agent_id,
                error = %e,
                "Failed to record recovery"
            );
            run.success = false;
            run.error.get_or_insert_with(|| e.to_string());
            if run.ticket_id.is_none() {
                self.emergency(&mut run, &format!("recovery history unavailable: {}", e))
                    .await;
            }
        }

        let target = run.outcome_phase();
        if target == RecoveryPhase::Completion {
            if let Err(e) = run.phases.advance(target, None) {
                warn!(recovery_id = %run.recovery_id, error = %e, "Unexpected phase at completion");
                run.success = false;
                run.phases.fail("completion out of order");
            }
        } else {
            let reason = run.error.clone().unwrap_or_else(|| "recovery failed".to_string());
            run.phases.fail(&reason);
        }

        let result = run.into_result();
        info!(
            recovery_id = %result.recovery_id,
            success = result.success,
            tactics = ?result.tactic_names(),
            attempts = result.attempts,
            duration_ms = result.duration_ms,
            "Recovery finished"
        );
        result
    }

    /// Assessment through Validation; errors are orchestrator faults
    async fn drive(
        &self,
        run: &mut RecoveryRun,
        callback: &dyn RecoveryCallback,
        deadline: Option<Instant>,
    ) -> OpResult<()> {
        let assessment = self.assess(&run.failure)?;

        run.phases.advance(RecoveryPhase::StrategySelection, None)?;
        let selection = select_tactics(&run.failure, &assessment);
        let (duration, probability) = self.estimate(&selection, &run.failure, &assessment);
        run.plan = RecoveryPlan::new(run.failure.id.clone(), selection.tactics, selection.priority)
            .with_estimates(duration, probability);
        info!(
            recovery_id = %run.recovery_id,
            agent_id = %run.failure.agent_id,
            plan = ?run.plan.labels(),
            priority = run.plan.priority,
            rule = selection.rule,
            "Recovery plan selected"
        );

        run.phases.advance(RecoveryPhase::Execution, None)?;
        self.execute_plan(run, &assessment, callback, deadline).await;
        run.assessment = Some(assessment);

        run.phases.advance(RecoveryPhase::Validation, None)?;
        run.success = self.validate(run);
        Ok(())
    }

    fn assess(&self, failure: &FailureRecord) -> OpResult<Assessment> {
        let check = self
            .loop_detector
            .record_and_check(&failure.agent_id, ObservedAction::from_failure(failure))?;
        let paused = self.loop_detector.is_paused(&failure.agent_id);
        let retryable = self.retry.should_retry(failure);
        let snapshots = self
            .snapshots
            .list(&failure.agent_id, &failure.task_id, None)?;
        let level = self.escalations.evaluate(failure, &failure.prior_attempts);
        let since = Utc::now() - chrono::Duration::hours(INTERVENTION_WINDOW_HOURS);
        let recent_interventions = self
            .history
            .query(
                &HistoryQuery::agent(&failure.agent_id)
                    .kind(EntryKind::Intervention)
                    .since(since),
            )?
            .len();

        debug!(
            agent_id = %failure.agent_id,
            is_loop = check.is_loop,
            paused,
            retryable,
            snapshots = snapshots.len(),
            level = %level,
            recent_interventions,
            "Failure assessed"
        );
        Ok(Assessment {
            loop_signals: check.signals,
            paused,
            retryable,
            snapshots,
            level,
            recent_interventions,
        })
    }

    /// Rough duration and success odds for a selection
    fn estimate(
        &self,
        selection: &Selection,
        failure: &FailureRecord,
        assessment: &Assessment,
    ) -> (f64, f64) {
        let retry_delay = self.retry.plan_retry(failure).delay.as_secs_f64();
        let retry_rate = self
            .retry
            .kind_success_rate(failure.kind)
            .unwrap_or_else(|| self.retry.recent_success_rate());
        let (duration, probability) = match selection.tactics.first() {
            Some(Tactic::BreakLoop) => (0.0, 0.5),
            Some(Tactic::Escalate) => (0.0, 0.9),
            Some(Tactic::Rollback) => (retry_delay, 0.9 * retry_rate),
            Some(Tactic::Retry) => (retry_delay, retry_rate),
            // Falls through to escalation when the retry fails
            Some(Tactic::Hybrid(_)) => (retry_delay, retry_rate + (1.0 - retry_rate) * 0.9),
            None => (0.0, 0.0),
        };
        // Humans stepping in recently means automation is struggling here
        let damping = 1.0 / (1.0 + 0.25 * assessment.recent_interventions as f64);
        (duration, probability * damping)
    }

    /// Last step succeeded, and the agent is free unless that step escalated
    fn validate(&self, run: &RecoveryRun) -> bool {
        let Some(last) = run.trace.last() else {
            return false;
        };
        if !last.success {
            return false;
        }
        last.tactic == TacticKind::Escalate || !self.loop_detector.is_paused(&run.failure.agent_id)
    }

    async fn emergency(&self, run: &mut RecoveryRun, reason: &str) {
        let started = Instant::now();
        let ticket_id = self
            .escalations
            .escalate_emergency(&run.failure, &run.failure.prior_attempts, reason)
            .await;
        let mut outcome = TacticOutcome::new(
            TacticKind::Escalate,
            true,
            format!("emergency escalation: {}", reason),
        );
        outcome.ticket_id = Some(ticket_id.clone());
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        run.trace.push(outcome);
        run.ticket_id = Some(ticket_id);
        self.stats_guard().emergency_escalations += 1;
    }

    // ── Facade ───────────────────────────────────────────────────────

    pub fn create_snapshot(
        &self,
        agent_id: &str,
        task_id: &str,
        state: &serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> OpResult<String> {
        self.snapshots.create(agent_id, task_id, state, metadata)
    }

    pub fn rollback(&self, snapshot_id: &str) -> OpResult<serde_json::Value> {
        self.snapshots.rollback(snapshot_id)
    }

    pub fn query(&self, query: &HistoryQuery) -> OpResult<Vec<HistoryEntry>> {
        self.history.query(query)
    }

    pub fn pending_escalations(&self, filter: &TicketFilter) -> OpResult<Vec<EscalationTicket>> {
        self.escalations.pending(filter)
    }

    /// Drain the escalation queue through the notifier
    pub async fn process_escalations(&self) -> OpResult<QueueReport> {
        self.escalations.process_queue().await
    }

    /// Resolve a ticket and record the intervention in the ticket's history
    pub fn resolve_escalation(
        &self,
        ticket_id: &str,
        resolution: &str,
        resolved_by: &str,
    ) -> OpResult<()> {
        self.escalations.resolve(ticket_id, resolution, resolved_by)?;
        let ticket = self.escalations.get(ticket_id)?;
        self.history.append(
            &ticket.agent_id,
            &ticket.task_id,
            EntryKind::Intervention,
            json!({
                "ticket_id": ticket.id,
                "level": ticket.level,
                "resolution": resolution,
                "resolved_by": resolved_by,
            }),
            HashMap::new(),
        )?;
        Ok(())
    }

    /// Append a task state to the ledger
    pub fn record_state(
        &self,
        agent_id: &str,
        task_id: &str,
        state: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> OpResult<String> {
        self.history
            .append(agent_id, task_id, EntryKind::State, state, metadata)
    }

    /// Append a failure to the ledger without recovering from it
    pub fn record_error(&self, failure: &FailureRecord) -> OpResult<String> {
        self.history.append(
            &failure.agent_id,
            &failure.task_id,
            EntryKind::Error,
            serde_json::to_value(failure)?,
            HashMap::from([("failure_kind".to_string(), json!(failure.kind))]),
        )
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
