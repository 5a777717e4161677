//! Retry Planner: retry eligibility, delay and input adjustment
//!
//! Decides whether a failure is worth retrying, computes the delay and input
//! adjustments for the next attempt, and runs that attempt against the
//! caller's [`RecoveryCallback`]. Every executed attempt feeds the rolling
//! statistics that drive the adaptive strategy.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::callback::RecoveryCallback;
use super::strategy::{apply_adjustments, Adjustment, BackoffParams, RetryStrategy};
use crate::error::{OpResult, OperationalError};
use crate::types::{AttemptOutcome, FailureKind, FailureRecord};

/// Rolling window length for success-rate statistics
const HISTORY_WINDOW: usize = 100;

/// Configuration for the Retry Planner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry count at which retrying stops
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
    /// Kinds that are never retried
    pub non_retryable: Vec<FailureKind>,
    /// Strategy per failure kind
    pub strategies: HashMap<FailureKind, RetryStrategy>,
    /// Strategy for kinds missing from `strategies`
    pub default_strategy: RetryStrategy,
    /// Refuse retries for kinds whose recent success rate is too low
    pub adaptive_learning: bool,
    pub adaptive_threshold: f64,
    /// Attempts needed for a kind before the adaptive cut-off applies
    pub adaptive_min_samples: usize,
    /// Only attempts this recent count toward a kind's success rate, so a
    /// refused kind becomes retryable again once its failures age out
    pub adaptive_window_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let strategies = HashMap::from([
            (FailureKind::Timeout, RetryStrategy::ExponentialBackoff),
            (FailureKind::CommunicationError, RetryStrategy::ExponentialBackoff),
            (FailureKind::ValidationError, RetryStrategy::LinearBackoff),
            (FailureKind::ConfigurationError, RetryStrategy::LinearBackoff),
            (FailureKind::ToolFailure, RetryStrategy::Adaptive),
            (FailureKind::AgentFailure, RetryStrategy::Adaptive),
            (FailureKind::Unknown, RetryStrategy::LinearBackoff),
        ]);
        Self {
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
            backoff_multiplier: 2.0,
            non_retryable: vec![
                FailureKind::InfiniteLoop,
                FailureKind::ConfigurationError,
                FailureKind::PermissionError,
            ],
            strategies,
            default_strategy: RetryStrategy::LinearBackoff,
            adaptive_learning: true,
            adaptive_threshold: 0.3,
            adaptive_min_samples: 5,
            adaptive_window_secs: 600,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> OpResult<()> {
        let finite = [self.base_delay_secs, self.max_delay_secs, self.backoff_multiplier];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(OperationalError::config("retry delays and multiplier must be finite"));
        }
        if self.base_delay_secs < 0.0 || self.max_delay_secs < 0.0 {
            return Err(OperationalError::config("retry delays must be non-negative"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(OperationalError::config("backoff_multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.adaptive_threshold) {
            return Err(OperationalError::config("adaptive_threshold must be within [0, 1]"));
        }
        Ok(())
    }

    fn adaptive_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.adaptive_window_secs as i64)
    }

    fn params(&self) -> BackoffParams {
        BackoffParams {
            base: self.base_delay_secs,
            max: self.max_delay_secs,
            multiplier: self.backoff_multiplier,
        }
    }
}

/// What the next attempt should look like
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPlan {
    pub kind: FailureKind,
    pub strategy: RetryStrategy,
    /// Zero-based attempt index (the failure's retry count)
    pub attempt: u32,
    pub delay: Duration,
    pub adjustments: Vec<Adjustment>,
    /// Task input with adjustments applied, when the failure carried one
    pub adjusted_input: Option<String>,
}

/// Success/failure counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub successes: u64,
    pub failures: u64,
}

impl OutcomeCounts {
    fn record(&mut self, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Snapshot of planner statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub totals: OutcomeCounts,
    pub by_strategy: HashMap<RetryStrategy, OutcomeCounts>,
    pub by_kind: HashMap<FailureKind, OutcomeCounts>,
    pub recent_success_rate: f64,
}

#[derive(Debug, Default)]
struct AttemptHistory {
    recent: VecDeque<bool>,
    recent_by_kind: HashMap<FailureKind, VecDeque<(DateTime<Utc>, bool)>>,
    totals: OutcomeCounts,
    by_strategy: HashMap<RetryStrategy, OutcomeCounts>,
    by_kind: HashMap<FailureKind, OutcomeCounts>,
}

fn push_window<T>(window: &mut VecDeque<T>, sample: T) {
    if window.len() == HISTORY_WINDOW {
        window.pop_front();
    }
    window.push_back(sample);
}

fn rate(window: &VecDeque<bool>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let ok = window.iter().filter(|s| **s).count();
    Some(ok as f64 / window.len() as f64)
}

impl AttemptHistory {
    fn record(&mut self, kind: FailureKind, strategy: RetryStrategy, success: bool, at: DateTime<Utc>) {
        push_window(&mut self.recent, success);
        push_window(self.recent_by_kind.entry(kind).or_default(), (at, success));
        self.totals.record(success);
        self.by_strategy.entry(strategy).or_default().record(success);
        self.by_kind.entry(kind).or_default().record(success);
    }
}

/// The Retry Planner
#[derive(Debug)]
pub struct RetryPlanner {
    config: RetryConfig,
    history: Mutex<AttemptHistory>,
}

impl RetryPlanner {
    /// Create a planner with default config
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config,
            history: Mutex::new(AttemptHistory::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether `failure` should be retried at all
    pub fn should_retry(&self, failure: &FailureRecord) -> bool {
        self.should_retry_at(failure, Utc::now())
    }

    pub fn should_retry_at(&self, failure: &FailureRecord, now: DateTime<Utc>) -> bool {
        if failure.retry_count >= self.config.max_retries {
            debug!(
                agent_id = %failure.agent_id,
                retry_count = failure.retry_count,
                "Retry budget exhausted"
            );
            return false;
        }
        if self.config.non_retryable.contains(&failure.kind) {
            debug!(agent_id = %failure.agent_id, kind = %failure.kind, "Failure kind is not retryable");
            return false;
        }
        if self.config.adaptive_learning {
            if let Some(rate) = self.kind_success_rate_at(failure.kind, now) {
                if rate < self.config.adaptive_threshold {
                    info!(
                        kind = %failure.kind,
                        success_rate = rate,
                        threshold = self.config.adaptive_threshold,
                        "Adaptive learning refuses retry"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Strategy configured for a failure kind
    pub fn strategy_for(&self, kind: FailureKind) -> RetryStrategy {
        self.config
            .strategies
            .get(&kind)
            .copied()
            .unwrap_or(self.config.default_strategy)
    }

    /// Build the plan for the next attempt after `failure`
    pub fn plan_retry(&self, failure: &FailureRecord) -> RetryPlan {
        let strategy = self.strategy_for(failure.kind);
        let attempt = failure.retry_count;
        let secs = strategy.delay_secs(attempt, self.config.params(), self.recent_success_rate());
        let adjustments = Adjustment::for_attempt(attempt + 1);
        let adjusted_input = failure
            .task_input()
            .map(|input| apply_adjustments(input, &adjustments, failure));

        debug!(
            agent_id = %failure.agent_id,
            strategy = %strategy,
            attempt,
            delay_secs = secs,
            "Planned retry"
        );

        RetryPlan {
            kind: failure.kind,
            strategy,
            attempt,
            delay: Duration::from_secs_f64(secs),
            adjustments,
            adjusted_input,
        }
    }

    /// Sleep for the planned delay, then invoke `callback`.
    ///
    /// Never propagates callback errors or panics; they become a failed
    /// [`AttemptOutcome`]. When `deadline` passes during the sleep or the
    /// call, the attempt is abandoned and counted as failed.
    pub async fn execute(
        &self,
        plan: &RetryPlan,
        callback: &dyn RecoveryCallback,
        deadline: Option<Instant>,
    ) -> AttemptOutcome {
        let strategy_name = plan.strategy.to_string();

        let wake_at = Instant::now() + plan.delay;
        match deadline {
            Some(deadline) if wake_at > deadline => {
                tokio::time::sleep_until(deadline).await;
                warn!(strategy = %plan.strategy, "Deadline exceeded during retry backoff");
                let outcome = AttemptOutcome::failed(strategy_name, "deadline exceeded during backoff");
                self.record(plan, false);
                return outcome;
            }
            _ => tokio::time::sleep_until(wake_at).await,
        }

        let call = AssertUnwindSafe(callback.attempt(plan.adjusted_input.clone())).catch_unwind();
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                Ok(r) => r,
                Err(_) => {
                    warn!(strategy = %plan.strategy, "Deadline exceeded during retry attempt");
                    self.record(plan, false);
                    return AttemptOutcome::failed(strategy_name, "deadline exceeded during attempt");
                }
            },
            None => call.await,
        };

        let outcome = match result {
            Ok(Ok(value)) => AttemptOutcome::succeeded(strategy_name, value),
            Ok(Err(e)) => AttemptOutcome::failed(strategy_name, format!("{:#}", e)),
            Err(_) => AttemptOutcome::failed(strategy_name, "recovery callback panicked"),
        };

        self.record(plan, outcome.success);
        debug!(
            strategy = %plan.strategy,
            attempt = plan.attempt,
            success = outcome.success,
            "Retry attempt finished"
        );
        outcome
    }

    /// Success rate over the planner's recent attempts, 1.0 with no history
    pub fn recent_success_rate(&self) -> f64 {
        self.history
            .lock()
            .ok()
            .and_then(|h| rate(&h.recent))
            .unwrap_or(1.0)
    }

    /// Success rate for `kind` over the adaptive window, once enough
    /// samples fall inside it
    pub fn kind_success_rate(&self, kind: FailureKind) -> Option<f64> {
        self.kind_success_rate_at(kind, Utc::now())
    }

    pub fn kind_success_rate_at(&self, kind: FailureKind, now: DateTime<Utc>) -> Option<f64> {
        let history = self.history.lock().ok()?;
        let cutoff = now - self.config.adaptive_window();
        let (ok, total) = history
            .recent_by_kind
            .get(&kind)?
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .fold((0usize, 0usize), |(ok, total), (_, success)| {
                (ok + usize::from(*success), total + 1)
            });
        if total == 0 || total < self.config.adaptive_min_samples {
            return None;
        }
        Some(ok as f64 / total as f64)
    }

    pub fn stats(&self) -> RetryStats {
        match self.history.lock() {
            Ok(h) => RetryStats {
                totals: h.totals,
                by_strategy: h.by_strategy.clone(),
                by_kind: h.by_kind.clone(),
                recent_success_rate: rate(&h.recent).unwrap_or(1.0),
            },
            Err(_) => RetryStats::default(),
        }
    }

    fn record(&self, plan: &RetryPlan, success: bool) {
        if let Ok(mut h) = self.history.lock() {
            h.record(plan.kind, plan.strategy, success, Utc::now());
        }
    }
}

impl Default for RetryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failure(kind: FailureKind, retry_count: u32) -> FailureRecord {
        FailureRecord::new("agent-1", "task-1", kind, "boom").with_retry_count(retry_count)
    }

    #[test]
    fn test_retry_cap_for_every_retryable_kind() {
        let planner = RetryPlanner::new();
        for &kind in FailureKind::all() {
            if planner.config().non_retryable.contains(&kind) {
                continue;
            }
            assert!(planner.should_retry(&failure(kind, 2)), "{} at 2", kind);
            assert!(!planner.should_retry(&failure(kind, 3)), "{} at 3", kind);
        }
    }

    #[test]
    fn test_non_retryable_kinds() {
        let planner = RetryPlanner::new();
        assert!(!planner.should_retry(&failure(FailureKind::InfiniteLoop, 0)));
        assert!(!planner.should_retry(&failure(FailureKind::ConfigurationError, 0)));
        assert!(!planner.should_retry(&failure(FailureKind::PermissionError, 0)));
    }

    #[test]
    fn test_default_strategy_mapping() {
        let planner = RetryPlanner::new();
        assert_eq!(planner.strategy_for(FailureKind::Timeout), RetryStrategy::ExponentialBackoff);
        assert_eq!(planner.strategy_for(FailureKind::ValidationError), RetryStrategy::LinearBackoff);
        assert_eq!(planner.strategy_for(FailureKind::ToolFailure), RetryStrategy::Adaptive);
        assert_eq!(planner.strategy_for(FailureKind::ResourceError), RetryStrategy::LinearBackoff);
    }

    #[test]
    fn test_plan_retry_applies_adjustments() {
        let planner = RetryPlanner::new();
        let f = failure(FailureKind::Timeout, 2).with_context("task_input", "fetch the page");
        let plan = planner.plan_retry(&f);
        assert_eq!(plan.strategy, RetryStrategy::ExponentialBackoff);
        assert_eq!(plan.delay, Duration::from_secs(4));
        assert_eq!(plan.adjustments.len(), 5);
        let input = plan.adjusted_input.unwrap();
        assert!(input.contains("fetch the page"));
        assert!(input.contains("different approach"));
    }

    #[test]
    fn test_plan_without_input() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::Unknown, 0));
        assert!(plan.adjusted_input.is_none());
        assert_eq!(plan.adjustments, vec![Adjustment::AddFailureContext]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_captures_errors_and_updates_stats() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::ValidationError, 0));

        let fail = |_input: Option<String>| async { Err::<serde_json::Value, _>(anyhow::anyhow!("nope")) };
        let outcome = planner.execute(&plan, &fail, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("nope"));
        assert_eq!(outcome.strategy_used, "linear_backoff");

        let ok = |_input: Option<String>| async { Ok::<_, anyhow::Error>(serde_json::json!({"done": true})) };
        let outcome = planner.execute(&plan, &ok, None).await;
        assert!(outcome.success);

        let stats = planner.stats();
        assert_eq!(stats.totals.successes, 1);
        assert_eq!(stats.totals.failures, 1);
        assert_eq!(planner.recent_success_rate(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sleeps_for_delay() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::Timeout, 3));
        assert_eq!(plan.delay, Duration::from_secs(8));

        let start = Instant::now();
        let ok = |_input: Option<String>| async { Ok::<_, anyhow::Error>(serde_json::Value::Null) };
        planner.execute(&plan, &ok, None).await;
        assert!(start.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_abandons_on_deadline() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::Timeout, 3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cb = move |_input: Option<String>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(serde_json::Value::Null)
            }
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        let outcome = planner.execute(&plan, &cb, Some(deadline)).await;
        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.error.unwrap().contains("deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_catches_panics() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::Unknown, 0));
        let cb = |_input: Option<String>| async {
            if true {
                panic!("task blew up");
            }
            Ok::<_, anyhow::Error>(serde_json::Value::Null)
        };
        let outcome = planner.execute(&plan, &cb, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("recovery callback panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_learning_blocks_hopeless_kind() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::ToolFailure, 0));
        let fail = |_input: Option<String>| async { Err::<serde_json::Value, _>(anyhow::anyhow!("tool down")) };
        for _ in 0..4 {
            planner.execute(&plan, &fail, None).await;
        }
        // Below the minimum sample count the cut-off does not apply
        assert!(planner.should_retry(&failure(FailureKind::ToolFailure, 0)));
        planner.execute(&plan, &fail, None).await;
        assert!(!planner.should_retry(&failure(FailureKind::ToolFailure, 0)));
        // Other kinds are unaffected
        assert!(planner.should_retry(&failure(FailureKind::Timeout, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_kind_recovers_once_failures_age_out() {
        let planner = RetryPlanner::new();
        let plan = planner.plan_retry(&failure(FailureKind::Timeout, 0));
        let fail = |_input: Option<String>| async { Err::<serde_json::Value, _>(anyhow::anyhow!("upstream down")) };
        for _ in 0..6 {
            planner.execute(&plan, &fail, None).await;
        }
        let f = failure(FailureKind::Timeout, 0);
        assert!(!planner.should_retry(&f));

        let window = planner.config().adaptive_window_secs as i64;
        let later = Utc::now() + chrono::Duration::seconds(window + 1);
        assert_eq!(planner.kind_success_rate_at(FailureKind::Timeout, later), None);
        assert!(planner.should_retry_at(&f, later));
        // Lifetime counters keep the old failures
        assert_eq!(planner.stats().by_kind[&FailureKind::Timeout].failures, 6);
    }

    #[test]
    fn test_non_finite_delays_are_rejected() {
        let config = RetryConfig {
            max_delay_secs: f64::INFINITY,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RetryConfig {
            backoff_multiplier: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RetryConfig {
            base_delay_secs: f64::INFINITY,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
