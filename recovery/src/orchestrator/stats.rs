//! Orchestrator counters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{RecoveryResult, TacticKind};

/// Point-in-time copy of the orchestrator's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub emergency_escalations: u64,
    /// Executed steps per tactic
    pub tactic_usage: BTreeMap<TacticKind, u64>,
    /// Running mean over all recoveries
    pub avg_duration_ms: f64,
}

impl OrchestratorStats {
    pub fn record(&mut self, result: &RecoveryResult) {
        self.total_recoveries += 1;
        if result.success {
            self.successful_recoveries += 1;
        } else {
            self.failed_recoveries += 1;
        }
        for tactic in &result.tactics_tried {
            *self.tactic_usage.entry(*tactic).or_default() += 1;
        }
        let n = self.total_recoveries as f64;
        self.avg_duration_ms += (result.duration_ms as f64 - self.avg_duration_ms) / n;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_recoveries == 0 {
            return 0.0;
        }
        self.successful_recoveries as f64 / self.total_recoveries as f64
    }
}
