//! Backoff strategies and input adjustments

use serde::{Deserialize, Serialize};

use crate::types::FailureRecord;

/// How long to wait before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    FixedDelay,
    LinearBackoff,
    ExponentialBackoff,
    /// Linear growth scaled up by the recent failure rate
    Adaptive,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::FixedDelay => write!(f, "fixed_delay"),
            Self::LinearBackoff => write!(f, "linear_backoff"),
            Self::ExponentialBackoff => write!(f, "exponential_backoff"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Delay parameters, all in seconds
#[derive(Debug, Clone, Copy)]
pub struct BackoffParams {
    pub base: f64,
    pub max: f64,
    pub multiplier: f64,
}

impl RetryStrategy {
    /// Delay in seconds for zero-based `attempt`.
    ///
    /// `recent_success_rate` is only read by [`RetryStrategy::Adaptive`].
    pub fn delay_secs(self, attempt: u32, params: BackoffParams, recent_success_rate: f64) -> f64 {
        let n = f64::from(attempt);
        let raw = match self {
            Self::Immediate => 0.0,
            Self::FixedDelay => params.base,
            Self::LinearBackoff => params.base * (n + 1.0),
            Self::ExponentialBackoff => params.base * params.multiplier.powf(n),
            Self::Adaptive => {
                let rate = recent_success_rate.clamp(0.0, 1.0);
                params.base * (1.0 + (1.0 - rate)) * (n + 1.0)
            }
        };
        if raw.is_finite() {
            raw.clamp(0.0, params.max.max(0.0))
        } else {
            params.max.max(0.0)
        }
    }
}

/// A transform applied to the task input before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    AddFailureContext,
    Simplify,
    Rephrase,
    ChangeApproach,
    AddExamples,
}

impl Adjustment {
    /// Cumulative adjustments for one-based attempt number `attempt`
    pub fn for_attempt(attempt: u32) -> Vec<Adjustment> {
        let mut out = Vec::new();
        if attempt >= 1 {
            out.push(Self::AddFailureContext);
        }
        if attempt >= 2 {
            out.extend([Self::Simplify, Self::Rephrase]);
        }
        if attempt >= 3 {
            out.extend([Self::ChangeApproach, Self::AddExamples]);
        }
        out
    }

    /// Apply this transform to `input`
    pub fn apply(self, input: &str, failure: &FailureRecord) -> String {
        match self {
            Self::AddFailureContext => format!(
                "{}\n\nNote: the previous attempt failed ({}): {}",
                input, failure.kind, failure.message
            ),
            Self::Simplify => format!(
                "{}\n\nKeep the solution as simple as possible and focus on the core requirement.",
                input
            ),
            Self::Rephrase => format!("Restated task:\n{}", input),
            Self::ChangeApproach => format!(
                "{}\n\nEarlier approaches did not work. Use a fundamentally different approach.",
                input
            ),
            Self::AddExamples => format!(
                "{}\n\nWork through a small concrete example before producing the final result.",
                input
            ),
        }
    }
}

/// Apply `adjustments` in order
pub fn apply_adjustments(input: &str, adjustments: &[Adjustment], failure: &FailureRecord) -> String {
    adjustments
        .iter()
        .fold(input.to_string(), |acc, adj| adj.apply(&acc, failure))
}
