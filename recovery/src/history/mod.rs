//! History Ledger: versioned audit trail per agent/task
//!
//! Every state, error, intervention and recovery is appended under the next
//! version of its agent/task pair. Versions start at 1 and are never reused,
//! even after retention deletes old entries; the last assigned version is
//! persisted as a sequence key next to the entries.
//!
//! Diffs serialize both versions' data canonically (sorted keys, pretty
//! printed) and compare them line by line.

pub mod diff;
pub mod ledger;

pub use diff::{unified_diff, DiffResult};
pub use ledger::{EntryKind, HistoryConfig, HistoryEntry, HistoryLedger, HistoryQuery, VersionSummary};
