//! Failure records and attempt outcomes
//!
//! A [`FailureRecord`] is immutable once created. Retrying produces a new
//! record via [`FailureRecord::next_attempt`] with the retry count bumped and
//! the outcome appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Business-level classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    CommunicationError,
    ValidationError,
    ResourceError,
    AgentFailure,
    ToolFailure,
    InfiniteLoop,
    ConfigurationError,
    PermissionError,
    Unknown,
}

impl FailureKind {
    /// All kinds, in declaration order
    pub fn all() -> &'static [FailureKind] {
        &[
            Self::Timeout,
            Self::CommunicationError,
            Self::ValidationError,
            Self::ResourceError,
            Self::AgentFailure,
            Self::ToolFailure,
            Self::InfiniteLoop,
            Self::ConfigurationError,
            Self::PermissionError,
            Self::Unknown,
        ]
    }

    /// Classify a free-text error message.
    ///
    /// Never fails: anything unrecognised maps to [`FailureKind::Unknown`].
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timed out", "timeout", "deadline exceeded"]) {
            Self::Timeout
        } else if has(&["permission denied", "forbidden", "unauthorized", "access denied"]) {
            Self::PermissionError
        } else if has(&["infinite loop", "loop detected", "recursion limit"]) {
            Self::InfiniteLoop
        } else if has(&["connection", "network", "unreachable", "broken pipe", "dns"]) {
            Self::CommunicationError
        } else if has(&["out of memory", "quota", "rate limit", "disk full", "resource"]) {
            Self::ResourceError
        } else if has(&["config", "missing setting", "not configured"]) {
            Self::ConfigurationError
        } else if has(&["invalid", "validation", "schema", "parse error", "malformed"]) {
            Self::ValidationError
        } else if has(&["tool"]) {
            Self::ToolFailure
        } else if has(&["agent", "model", "llm"]) {
            Self::AgentFailure
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::CommunicationError => "communication_error",
            Self::ValidationError => "validation_error",
            Self::ResourceError => "resource_error",
            Self::AgentFailure => "agent_failure",
            Self::ToolFailure => "tool_failure",
            Self::InfiniteLoop => "infinite_loop",
            Self::ConfigurationError => "configuration_error",
            Self::PermissionError => "permission_error",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// How bad a failure is
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Score used by escalation priority: 1, 3, 7, 10
    pub fn score(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 3.0,
            Self::High => 7.0,
            Self::Critical => 10.0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Result of a single recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    /// Strategy or tactic that produced this attempt
    pub strategy_used: String,
    pub success: bool,
    /// Value returned by the task on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AttemptOutcome {
    pub fn succeeded(strategy: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            strategy_used: strategy.into(),
            success: true,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(strategy: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            strategy_used: strategy.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// A failure of a supervised task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub prior_attempts: Vec<AttemptOutcome>,
    #[serde(default)]
    pub context_data: HashMap<String, serde_json::Value>,
}

impl FailureRecord {
    /// Create a fresh failure with no prior attempts
    pub fn new(
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            kind,
            severity: Severity::default(),
            message: message.into(),
            occurred_at: Utc::now(),
            retry_count: 0,
            prior_attempts: Vec::new(),
            context_data: HashMap::new(),
        }
    }

    /// Create a failure whose kind is classified from the message
    pub fn from_message(
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let kind = FailureKind::classify(&message);
        Self::new(agent_id, task_id, kind, message)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_prior_attempts(mut self, attempts: Vec<AttemptOutcome>) -> Self {
        self.prior_attempts = attempts;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context_data.insert(key.into(), value.into());
        self
    }

    /// Successor record after `outcome` failed again.
    pub fn next_attempt(&self, outcome: AttemptOutcome) -> Self {
        let mut prior_attempts = self.prior_attempts.clone();
        let message = outcome
            .error
            .clone()
            .unwrap_or_else(|| self.message.clone());
        prior_attempts.push(outcome);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: self.agent_id.clone(),
            task_id: self.task_id.clone(),
            kind: self.kind,
            severity: self.severity,
            message,
            occurred_at: Utc::now(),
            retry_count: self.retry_count + 1,
            prior_attempts,
            context_data: self.context_data.clone(),
        }
    }

    /// Number of prior attempts that failed
    pub fn failed_attempts(&self) -> usize {
        self.prior_attempts.iter().filter(|a| !a.success).count()
    }

    /// Task input carried in the context, if any
    pub fn task_input(&self) -> Option<&str> {
        self.context_data.get("task_input").and_then(|v| v.as_str())
    }

    /// Numeric context value clamped to 0–10, defaulting to 5
    pub fn context_score(&self, key: &str) -> f64 {
        self.context_data
            .get(key)
            .and_then(|v| v.as_f64())
            .map(|v| v.clamp(0.0, 10.0))
            .unwrap_or(5.0)
    }
}
