//! Assessment snapshot and tactic selection

use serde::{Deserialize, Serialize};

use crate::escalation::EscalationLevel;
use crate::loop_detect::LoopSignal;
use crate::snapshot::SnapshotSummary;
use crate::types::{FailureRecord, Severity, Tactic};

/// Prior attempts at which a failure goes straight to escalation
pub const ESCALATE_AFTER_PRIOR_ATTEMPTS: usize = 3;
/// Retry count at which a rollback precedes the next retry
pub const ROLLBACK_AFTER_RETRIES: u32 = 2;

/// Everything the orchestrator learned about a failure before planning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    /// Loop checks fired on this failure
    pub loop_signals: Vec<LoopSignal>,
    pub paused: bool,
    pub retryable: bool,
    /// Newest first
    pub snapshots: Vec<SnapshotSummary>,
    pub level: EscalationLevel,
    pub recent_interventions: usize,
}

impl Assessment {
    /// A fresh loop detection or a breaker still open from an earlier one
    pub fn loop_detected(&self) -> bool {
        !self.loop_signals.is_empty() || self.paused
    }

    pub fn should_escalate(&self) -> bool {
        self.level >= EscalationLevel::HumanIntervention
    }
}

/// Tactic list and priority chosen for a failure
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub tactics: Vec<Tactic>,
    pub priority: u8,
    pub rule: &'static str,
}

/// Fixed-precedence plan choice; first matching rule wins
pub fn select_tactics(failure: &FailureRecord, assessment: &Assessment) -> Selection {
    let pick = |tactics: Vec<Tactic>, priority: u8, rule: &'static str| Selection {
        tactics,
        priority,
        rule,
    };

    if assessment.loop_detected() {
        pick(vec![Tactic::BreakLoop], 10, "loop detected")
    } else if assessment.should_escalate()
        || failure.severity == Severity::Critical
        || failure.prior_attempts.len() >= ESCALATE_AFTER_PRIOR_ATTEMPTS
    {
        pick(vec![Tactic::Escalate], 8, "escalation required")
    } else if !assessment.snapshots.is_empty() && failure.retry_count >= ROLLBACK_AFTER_RETRIES {
        pick(vec![Tactic::Rollback, Tactic::Retry], 6, "rollback before retry")
    } else if assessment.retryable {
        pick(vec![Tactic::Retry], 3, "retryable")
    } else if !failure.prior_attempts.is_empty() {
        pick(vec![Tactic::default_hybrid()], 5, "hybrid after prior attempts")
    } else {
        pick(vec![Tactic::Escalate], 2, "fallback")
    }
}

/// Leaf steps in execution order, with Hybrid sequences inlined
pub fn flatten(tactics: &[Tactic]) -> Vec<Tactic> {
    let mut steps = Vec::with_capacity(tactics.len());
    for tactic in tactics {
        match tactic {
            Tactic::Hybrid(inner) => steps.extend(flatten(inner)),
            leaf => steps.push(leaf.clone()),
        }
    }
    steps
}
