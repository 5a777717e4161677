//! Recovery plans, tactics and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::AttemptOutcome;

/// A concrete recovery action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "tactic", content = "steps")]
pub enum Tactic {
    Retry,
    Rollback,
    Escalate,
    BreakLoop,
    /// Ordered sequence; the first successful Retry or Escalate wins
    Hybrid(Vec<Tactic>),
}

impl Tactic {
    /// Rollback → Retry → Escalate
    pub fn default_hybrid() -> Self {
        Self::Hybrid(vec![Self::Rollback, Self::Retry, Self::Escalate])
    }

    pub fn kind(&self) -> TacticKind {
        match self {
            Self::Retry => TacticKind::Retry,
            Self::Rollback => TacticKind::Rollback,
            Self::Escalate => TacticKind::Escalate,
            Self::BreakLoop => TacticKind::BreakLoop,
            Self::Hybrid(_) => TacticKind::Hybrid,
        }
    }
}

impl std::fmt::Display for Tactic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Tag of a [`Tactic`], used for traces and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TacticKind {
    Retry,
    Rollback,
    Escalate,
    BreakLoop,
    Hybrid,
}

impl std::fmt::Display for TacticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "Retry"),
            Self::Rollback => write!(f, "Rollback"),
            Self::Escalate => write!(f, "Escalate"),
            Self::BreakLoop => write!(f, "BreakLoop"),
            Self::Hybrid => write!(f, "Hybrid"),
        }
    }
}

/// Ordered tactic list built for one failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub failure_id: String,
    pub tactics: Vec<Tactic>,
    /// 2 (fallback) to 10 (loop break)
    pub priority: u8,
    pub estimated_duration_secs: f64,
    pub success_probability: f64,
}

impl RecoveryPlan {
    pub fn new(failure_id: impl Into<String>, tactics: Vec<Tactic>, priority: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            failure_id: failure_id.into(),
            tactics,
            priority,
            estimated_duration_secs: 0.0,
            success_probability: 0.0,
        }
    }

    pub fn with_estimates(mut self, duration_secs: f64, probability: f64) -> Self {
        self.estimated_duration_secs = duration_secs.max(0.0);
        self.success_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Top-level tactic names, e.g. `["Rollback", "Retry"]`
    pub fn labels(&self) -> Vec<String> {
        self.tactics.iter().map(|t| t.to_string()).collect()
    }
}

/// Phases of one recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Assessment,
    StrategySelection,
    Execution,
    Validation,
    Completion,
    Failure,
}

impl std::fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assessment => write!(f, "assessment"),
            Self::StrategySelection => write!(f, "strategy_selection"),
            Self::Execution => write!(f, "execution"),
            Self::Validation => write!(f, "validation"),
            Self::Completion => write!(f, "completion"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Outcome of one executed tactic step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TacticOutcome {
    pub tactic: TacticKind,
    pub success: bool,
    pub detail: String,
    /// Callback attempts made by this step (Retry only)
    #[serde(default)]
    pub attempts: Vec<AttemptOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl TacticOutcome {
    pub fn new(tactic: TacticKind, success: bool, detail: impl Into<String>) -> Self {
        Self {
            tactic,
            success,
            detail: detail.into(),
            attempts: Vec::new(),
            ticket_id: None,
            snapshot_id: None,
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }
}

/// What every `recover` call returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub recovery_id: String,
    pub failure_id: String,
    pub success: bool,
    pub plan: RecoveryPlan,
    /// Executed steps in order, Hybrid flattened
    pub tactics_tried: Vec<TacticKind>,
    pub trace: Vec<TacticOutcome>,
    /// Total recovery callback invocations
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_ticket_id: Option<String>,
    /// State returned by a rollback step; the caller applies it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_state: Option<serde_json::Value>,
    pub final_phase: RecoveryPhase,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryResult {
    /// Executed step names, e.g. `["Rollback", "Retry"]`
    pub fn tactic_names(&self) -> Vec<String> {
        self.tactics_tried.iter().map(|t| t.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_labels() {
        let plan = RecoveryPlan::new("f1", vec![Tactic::Rollback, Tactic::Retry], 6);
        assert_eq!(plan.labels(), vec!["Rollback", "Retry"]);
    }

    #[test]
    fn test_hybrid_kind() {
        assert_eq!(Tactic::default_hybrid().kind(), TacticKind::Hybrid);
        assert_eq!(Tactic::default_hybrid().to_string(), "Hybrid");
    }

    #[test]
    fn test_estimates_are_clamped() {
        let plan = RecoveryPlan::new("f", vec![Tactic::Retry], 3).with_estimates(-1.0, 1.7);
        assert_eq!(plan.estimated_duration_secs, 0.0);
        assert_eq!(plan.success_probability, 1.0);
    }
}
