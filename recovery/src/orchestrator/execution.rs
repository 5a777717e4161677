//! Tactic execution
//!
//! Each leaf tactic delegates to the component that owns it and reports a
//! [`TacticOutcome`]. Tactic failures never abort the run; they are recorded
//! and the next planned step runs.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::selection::{flatten, Assessment};
use super::{deadline_passed, RecoveryOrchestrator, RecoveryRun};
use crate::retry::RecoveryCallback;
use crate::types::{FailureRecord, Tactic, TacticKind, TacticOutcome};

fn finish(mut outcome: TacticOutcome, started: Instant) -> TacticOutcome {
    outcome.duration_ms = started.elapsed().as_millis() as u64;
    outcome
}

impl RecoveryOrchestrator {
    /// Run the plan's steps in order until one ends the run.
    ///
    /// A successful Rollback only prepares the next step; any other
    /// successful step (or a Rollback that is the last step) stops execution.
    pub(super) async fn execute_plan(
        &self,
        run: &mut RecoveryRun,
        assessment: &Assessment,
        callback: &dyn RecoveryCallback,
        deadline: Option<Instant>,
    ) {
        let steps = flatten(&run.plan.tactics);
        let last = steps.len().saturating_sub(1);
        // Retries advance this record; the original stays on the run
        let mut current = run.failure.clone();

        for (i, step) in steps.iter().enumerate() {
            let outcome = match step {
                Tactic::Retry => self.run_retry(&mut current, callback, deadline).await,
                Tactic::Rollback => {
                    let (outcome, state) = self.run_rollback(&current, assessment);
                    if state.is_some() {
                        run.restored_state = state;
                    }
                    outcome
                }
                Tactic::Escalate => self.run_escalate(&current),
                Tactic::BreakLoop => self.run_break_loop(&current, assessment),
                // flatten() leaves no nested sequences
                Tactic::Hybrid(_) => continue,
            };

            debug!(
                recovery_id = %run.recovery_id,
                agent_id = %current.agent_id,
                tactic = %outcome.tactic,
                success = outcome.success,
                "Tactic finished: {}",
                outcome.detail
            );
            if let Some(ticket_id) = &outcome.ticket_id {
                run.ticket_id = Some(ticket_id.clone());
            }
            let stop = outcome.success && (outcome.tactic != TacticKind::Rollback || i == last);
            run.trace.push(outcome);
            if stop {
                break;
            }
        }
    }

    /// Attempt the task while the planner allows another retry
    async fn run_retry(
        &self,
        current: &mut FailureRecord,
        callback: &dyn RecoveryCallback,
        deadline: Option<Instant>,
    ) -> TacticOutcome {
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut success = false;
        let mut deadline_hit = false;

        while self.retry.should_retry(current) {
            if deadline_passed(deadline) {
                deadline_hit = true;
                break;
            }
            let plan = self.retry.plan_retry(current);
            let attempt = self.retry.execute(&plan, callback, deadline).await;
            attempts.push(attempt.clone());
            if attempt.success {
                success = true;
                break;
            }
            *current = current.next_attempt(attempt);
        }

        let detail = if success {
            format!("succeeded on attempt {}", attempts.len())
        } else if deadline_hit || deadline_passed(deadline) {
            format!("deadline exceeded after {} attempts", attempts.len())
        } else if attempts.is_empty() {
            format!("retry not permitted at retry count {}", current.retry_count)
        } else {
            format!("{} attempts failed", attempts.len())
        };
        let mut outcome = TacticOutcome::new(TacticKind::Retry, success, detail);
        outcome.attempts = attempts;
        finish(outcome, started)
    }

    /// Restore the newest verified snapshot seen during assessment
    fn run_rollback(
        &self,
        current: &FailureRecord,
        assessment: &Assessment,
    ) -> (TacticOutcome, Option<serde_json::Value>) {
        let started = Instant::now();
        let Some(summary) = assessment.snapshots.first() else {
            let outcome = TacticOutcome::new(TacticKind::Rollback, false, "no snapshot available");
            return (finish(outcome, started), None);
        };

        let (mut outcome, state) = match self.snapshots.rollback(&summary.id) {
            Ok(state) => (
                TacticOutcome::new(TacticKind::Rollback, true, format!("restored snapshot {}", summary.id)),
                Some(state),
            ),
            Err(e) => {
                warn!(
                    agent_id = %current.agent_id,
                    snapshot_id = %summary.id,
                    error = %e,
                    "Rollback failed"
                );
                (TacticOutcome::new(TacticKind::Rollback, false, e.to_string()), None)
            }
        };
        outcome.snapshot_id = Some(summary.id.clone());
        (finish(outcome, started), state)
    }

    fn run_escalate(&self, current: &FailureRecord) -> TacticOutcome {
        let started = Instant::now();
        let outcome = match self.escalations.escalate(current, &current.prior_attempts, None) {
            Ok(ticket_id) => {
                let mut outcome = TacticOutcome::new(
                    TacticKind::Escalate,
                    true,
                    format!("ticket {} opened", ticket_id),
                );
                outcome.ticket_id = Some(ticket_id);
                outcome
            }
            Err(e) => {
                warn!(agent_id = %current.agent_id, error = %e, "Escalation failed");
                TacticOutcome::new(TacticKind::Escalate, false, e.to_string())
            }
        };
        finish(outcome, started)
    }

    fn run_break_loop(&self, current: &FailureRecord, assessment: &Assessment) -> TacticOutcome {
        let started = Instant::now();
        let reason = if assessment.loop_signals.is_empty() {
            "circuit breaker still open".to_string()
        } else {
            assessment
                .loop_signals
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };

        let outcome = match self.loop_detector.break_loop(&current.agent_id, &reason) {
            Ok(()) => {
                info!(agent_id = %current.agent_id, "Loop broken: {}", reason);
                TacticOutcome::new(TacticKind::BreakLoop, true, reason)
            }
            Err(e) => {
                warn!(agent_id = %current.agent_id, error = %e, "Breaking loop failed");
                TacticOutcome::new(TacticKind::BreakLoop, false, e.to_string())
            }
        };
        finish(outcome, started)
    }
}
