//! Agent Recovery Core
//!
//! Fault recovery for supervised agent tasks. Given a failure, the
//! [`RecoveryOrchestrator`] assesses it, picks a plan of tactics and runs
//! them against five components:
//!
//! - [`RetryPlanner`]: retry eligibility, backoff delays and input adjustments
//! - [`SnapshotStore`]: checksummed task state for rollback
//! - [`LoopDetector`]: repetition, error-sequence, state-cycle and flood
//!   checks with per-agent circuit breakers
//! - [`EscalationDesk`]: leveled, prioritized tickets for human or
//!   supervisor attention
//! - [`HistoryLedger`]: versioned audit trail with line diffs
//!
//! All state lives behind the [`KvStore`] contract. [`InMemoryStore`] backs
//! tests and embedded use; a RocksDB store is available with the
//! `rocksdb-backend` feature.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_recovery::{FailureKind, FailureRecord, InMemoryStore, RecoveryConfig, RecoveryOrchestrator};
//!
//! # async fn demo() -> Result<(), agent_recovery::OperationalError> {
//! let orchestrator = RecoveryOrchestrator::new(Arc::new(InMemoryStore::new()), RecoveryConfig::default())?;
//! let failure = FailureRecord::new("agent-7", "task-42", FailureKind::Timeout, "upstream timed out");
//! let result = orchestrator
//!     .recover(failure, &|_input: Option<String>| async { Ok::<_, anyhow::Error>(serde_json::json!({"done": true})) })
//!     .await;
//! println!("recovered: {} via {:?}", result.success, result.tactic_names());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod canonical;
pub mod config;
pub mod error;
pub mod escalation;
pub mod history;
pub mod loop_detect;
pub mod orchestrator;
pub mod retention;
pub mod retry;
pub mod snapshot;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use config::RecoveryConfig;
pub use error::{OpResult, OperationalError};
pub use telemetry::init_tracing;

// Re-export the data model
pub use types::{
    AttemptOutcome, FailureKind, FailureRecord, RecoveryPhase, RecoveryPlan, RecoveryResult,
    Severity, Tactic, TacticKind, TacticOutcome,
};

// Re-export storage types
pub use storage::{InMemoryStore, KvStore, KvStoreExt, SharedStore};

#[cfg(feature = "rocksdb-backend")]
pub use storage::RocksStore;

// Re-export component types
pub use escalation::{
    EscalationConfig, EscalationDesk, EscalationLevel, EscalationTicket, LogNotifier, Notifier,
    TicketFilter, TicketStatus,
};
pub use history::{DiffResult, EntryKind, HistoryConfig, HistoryEntry, HistoryLedger, HistoryQuery};
pub use loop_detect::{LoopCheck, LoopConfig, LoopDetector, LoopPattern, ObservedAction};
pub use orchestrator::{OrchestratorStats, RecoveryOrchestrator};
pub use retry::{RecoveryCallback, RetryConfig, RetryPlanner, RetryStrategy};
pub use snapshot::{Snapshot, SnapshotConfig, SnapshotStore, SnapshotSummary};
