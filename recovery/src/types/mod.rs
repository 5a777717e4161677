//! Shared data model for the recovery core
//!
//! Records owned by the individual stores live with their store
//! (snapshots, history entries, loop patterns, tickets). This module holds
//! the types that flow between components.

pub mod failure;
pub mod plan;

pub use failure::{AttemptOutcome, FailureKind, FailureRecord, Severity};
pub use plan::{
    RecoveryPhase, RecoveryPlan, RecoveryResult, Tactic, TacticKind, TacticOutcome,
};

