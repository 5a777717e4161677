//! Retry planning and execution
//!
//! # Strategies
//!
//! ```text
//! Immediate           0
//! FixedDelay          min(base, max)
//! LinearBackoff       min(base * (n + 1), max)
//! ExponentialBackoff  min(base * mult^n, max)
//! Adaptive            min(base * (1 + (1 - recent_success_rate)) * (n + 1), max)
//! ```
//!
//! Input adjustments accumulate with the attempt number: failure context
//! first, then simplify + rephrase, then change-approach + examples.

pub mod callback;
pub mod planner;
pub mod strategy;

pub use callback::RecoveryCallback;
pub use planner::{OutcomeCounts, RetryConfig, RetryPlan, RetryPlanner, RetryStats};
pub use strategy::{apply_adjustments, Adjustment, BackoffParams, RetryStrategy};
