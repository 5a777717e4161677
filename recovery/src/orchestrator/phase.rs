//! Phase tracking for one recovery run
//!
//! ```text
//! Assessment → StrategySelection → Execution → Validation → Completion
//!      └──────────────┴──────────────┴────────────┴──────→ Failure
//! ```

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{OpResult, OperationalError};
use crate::types::RecoveryPhase;

fn is_terminal(phase: RecoveryPhase) -> bool {
    matches!(phase, RecoveryPhase::Completion | RecoveryPhase::Failure)
}

fn is_legal_transition(from: RecoveryPhase, to: RecoveryPhase) -> bool {
    use RecoveryPhase::*;

    if to == Failure && !is_terminal(from) {
        return true;
    }
    matches!(
        (from, to),
        (Assessment, StrategySelection)
            | (StrategySelection, Execution)
            | (Execution, Validation)
            | (Validation, Completion)
    )
}

/// One recorded phase change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RecoveryPhase,
    pub to: RecoveryPhase,
    /// Milliseconds since the run started
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Current phase plus the log of how the run got there
#[derive(Debug)]
pub struct PhaseTracker {
    current: RecoveryPhase,
    started: Instant,
    transitions: Vec<PhaseTransition>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: RecoveryPhase::Assessment,
            started: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RecoveryPhase {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(self.current)
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn advance(&mut self, to: RecoveryPhase, reason: Option<&str>) -> OpResult<()> {
        if !is_legal_transition(self.current, to) {
            return Err(OperationalError::transition(self.current, to));
        }
        debug!(from = %self.current, to = %to, "Recovery phase transition");
        self.transitions.push(PhaseTransition {
            from: self.current,
            to,
            elapsed_ms: self.elapsed_ms(),
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Move to Failure; no-op once the run is already terminal
    pub fn fail(&mut self, reason: &str) {
        if !self.is_terminal() {
            // Always legal from a non-terminal phase
            let _ = self.advance(RecoveryPhase::Failure, Some(reason));
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
