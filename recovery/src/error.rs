//! Operational error types
//!
//! Infrastructure-level failures of the recovery core itself. These are
//! distinct from [`FailureKind`](crate::types::FailureKind), which classifies
//! the failures of the supervised task and drives strategy selection.

use thiserror::Error;

/// Result type alias for recovery-core operations
pub type OpResult<T> = Result<T, OperationalError>;

/// Errors raised by the stores and the orchestrator
#[derive(Error, Debug)]
pub enum OperationalError {
    /// Backing key-value store rejected or could not serve the request
    #[error("Storage unavailable ({namespace}): {message}")]
    StorageUnavailable { namespace: String, message: String },

    /// Snapshot checksum does not match its state blob
    #[error("Integrity check failed for snapshot {snapshot_id}: expected {expected}, got {actual}")]
    Integrity {
        snapshot_id: String,
        expected: String,
        actual: String,
    },

    /// Ticket already reached a terminal state
    #[error("Escalation ticket {ticket_id} already {status}")]
    AlreadyResolved { ticket_id: String, status: String },

    /// Requested record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lifecycle transition not permitted
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OperationalError {
    /// Create a storage error for a namespace
    pub fn storage(namespace: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            namespace: namespace.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create an invalid transition error
    pub fn transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an invalid configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Check if this error is transient and the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageUnavailable { .. } => true,
            // Corrupt state never heals by itself
            Self::Integrity { .. } => false,
            Self::AlreadyResolved { .. } => false,
            _ => false,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            Self::Integrity { .. } => "INTEGRITY_ERROR",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }
}

impl From<serde_json::Error> for OperationalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_retryable() {
        let err = OperationalError::storage("snapshots", "connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        assert!(err.to_string().contains("snapshots"));
    }

    #[test]
    fn test_integrity_not_retryable() {
        let err = OperationalError::Integrity {
            snapshot_id: "s1".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "INTEGRITY_ERROR");
    }

    #[test]
    fn test_not_found_display() {
        let err = OperationalError::not_found("snapshot", "abc");
        assert_eq!(err.to_string(), "snapshot not found: abc");
    }
}
