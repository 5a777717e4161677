//! Loop Detector: repetition detection and per-agent circuit breakers
//!
//! Every observed action or failure is appended to a bounded per-agent ring
//! buffer and run through four independent checks:
//!
//! 1. **Repetition**: the newest window of length L matches the preceding
//!    windows `max(3, max_iterations / L)` times in a row
//! 2. **Error sequence**: the last five failure kinds are identical, or the
//!    last six alternate ABABAB
//! 3. **State cycle**: the current state hash recurs within the time window
//! 4. **Flood**: more than `max_iterations` actions in the flood window
//!
//! Any hit records a [`LoopPattern`] and opens the agent's breaker. Breakers
//! close lazily when read after their timeout.

pub mod breaker;
pub mod detector;
pub mod similarity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OpResult, OperationalError};
use crate::types::{FailureKind, FailureRecord};

pub use breaker::{BreakerStatus, CircuitBreakerState};
pub use detector::LoopDetector;

/// Configuration for the Loop Detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Ring buffer capacity per agent
    pub buffer_size: usize,
    pub min_pattern_length: usize,
    pub max_pattern_length: usize,
    /// Flood limit, also scales the repetition threshold
    pub max_iterations: usize,
    /// Mean pairwise similarity for two windows to count as equal
    pub similarity_threshold: f64,
    /// Window for state-cycle detection
    pub time_window_secs: u64,
    /// Window for flood detection
    pub flood_window_secs: u64,
    /// How long an opened breaker stays open
    pub breaker_timeout_secs: u64,
    pub error_sequence_length: usize,
    pub state_repeat_threshold: usize,
    /// Signatures hashed into a pattern id
    pub signature_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            min_pattern_length: 3,
            max_pattern_length: 20,
            max_iterations: 50,
            similarity_threshold: 0.8,
            time_window_secs: 300,
            flood_window_secs: 60,
            breaker_timeout_secs: 60,
            error_sequence_length: 5,
            state_repeat_threshold: 3,
            signature_window: 10,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> OpResult<()> {
        if self.buffer_size == 0 || self.signature_window == 0 {
            return Err(OperationalError::config("loop buffer_size and signature_window must be > 0"));
        }
        if self.min_pattern_length == 0 || self.min_pattern_length > self.max_pattern_length {
            return Err(OperationalError::config(format!(
                "invalid loop pattern lengths {}..={}",
                self.min_pattern_length, self.max_pattern_length
            )));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(OperationalError::config("similarity_threshold must be within [0, 1]"));
        }
        if self.error_sequence_length < 2 || self.state_repeat_threshold < 2 {
            return Err(OperationalError::config(
                "error_sequence_length and state_repeat_threshold must be >= 2",
            ));
        }
        Ok(())
    }
}

/// One action or failure as seen by the detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedAction {
    /// Action type, or the failure kind for failures
    pub kind: String,
    pub message: String,
    /// Externally supplied task state, hashed for cycle detection
    #[serde(default)]
    pub state: Option<serde_json::Value>,
    /// Set when the action is a failure
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
}

impl ObservedAction {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            state: None,
            failure_kind: None,
            timestamp: Utc::now(),
        }
    }

    /// Observation of a task failure
    pub fn from_failure(failure: &FailureRecord) -> Self {
        Self {
            kind: failure.kind.to_string(),
            message: failure.message.clone(),
            state: failure.context_data.get("state").cloned(),
            failure_kind: Some(failure.kind),
            timestamp: failure.occurred_at,
        }
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }

    /// Override the observation time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Which check fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal")]
pub enum LoopSignal {
    Repetition { length: usize, repeats: usize },
    ErrorSequence { kinds: Vec<FailureKind> },
    StateCycle { occurrences: usize },
    Flood { actions: usize, window_secs: u64 },
}

impl std::fmt::Display for LoopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repetition { length, repeats } => {
                write!(f, "window of {} actions repeated {} times", length, repeats)
            }
            Self::ErrorSequence { kinds } => write!(f, "repeating error sequence over {} failures", kinds.len()),
            Self::StateCycle { occurrences } => write!(f, "state recurred {} times", occurrences),
            Self::Flood { actions, window_secs } => {
                write!(f, "{} actions within {}s", actions, window_secs)
            }
        }
    }
}

/// A repeating subsequence detected for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPattern {
    pub id: String,
    pub agent_id: String,
    pub pattern_hash: String,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Canonical cycle of action signatures
    pub sample_actions: Vec<String>,
}

/// Result of [`LoopDetector::record_and_check`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopCheck {
    pub is_loop: bool,
    pub pattern: Option<LoopPattern>,
    pub signals: Vec<LoopSignal>,
}
