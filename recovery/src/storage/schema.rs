//! Namespace definitions and compound key builders
//!
//! Each namespace provides logical separation of record types while sharing
//! one backing store. Key components are joined with `:`; zero-padded
//! numeric components keep lexicographic order equal to numeric order.

/// Namespace for state snapshots
pub const NS_SNAPSHOTS: &str = "snapshots";

/// Namespace for the versioned history ledger
pub const NS_HISTORY: &str = "history";

/// Namespace for detected loop patterns
pub const NS_LOOP_PATTERNS: &str = "loop_patterns";

/// Namespace for per-agent circuit breakers
pub const NS_CIRCUIT_BREAKERS: &str = "circuit_breakers";

/// Namespace for escalation tickets
pub const NS_ESCALATIONS: &str = "escalations";

/// All namespace names
pub const ALL_NAMESPACES: &[&str] = &[
    NS_SNAPSHOTS,
    NS_HISTORY,
    NS_LOOP_PATTERNS,
    NS_CIRCUIT_BREAKERS,
    NS_ESCALATIONS,
];

pub mod keys {
    /// Snapshot record key
    pub fn snapshot(snapshot_id: &str) -> String {
        format!("snap:{}", snapshot_id)
    }

    /// Snapshot index key, ordered by creation time within an agent/task
    pub fn snapshot_index(agent_id: &str, task_id: &str, created_nanos: i64, id: &str) -> String {
        format!("idx:{}:{}:{:020}:{}", agent_id, task_id, created_nanos, id)
    }

    /// Prefix of all snapshot index keys for an agent
    pub fn snapshot_index_agent_prefix(agent_id: &str) -> String {
        format!("idx:{}:", agent_id)
    }

    /// Prefix of snapshot index keys for an agent/task pair
    pub fn snapshot_index_prefix(agent_id: &str, task_id: &str) -> String {
        format!("idx:{}:{}:", agent_id, task_id)
    }

    /// Parse the snapshot id (last component) from an index key
    pub fn parse_snapshot_index_id(key: &str) -> Option<&str> {
        key.strip_prefix("idx:")?.rsplit(':').next()
    }

    /// History entry key
    pub fn history_entry(agent_id: &str, task_id: &str, version: u64) -> String {
        format!("entry:{}:{}:{:012}", agent_id, task_id, version)
    }

    /// Prefix of all history entries for an agent
    pub fn history_agent_prefix(agent_id: &str) -> String {
        format!("entry:{}:", agent_id)
    }

    /// Prefix of history entries for an agent/task pair
    pub fn history_prefix(agent_id: &str, task_id: &str) -> String {
        format!("entry:{}:{}:", agent_id, task_id)
    }

    /// Persisted version counter for an agent/task pair
    pub fn history_sequence(agent_id: &str, task_id: &str) -> String {
        format!("seq:{}:{}", agent_id, task_id)
    }

    /// Loop pattern key
    pub fn loop_pattern(agent_id: &str, pattern_hash: &str) -> String {
        format!("pat:{}:{}", agent_id, pattern_hash)
    }

    /// Prefix of loop patterns for an agent
    pub fn loop_pattern_prefix(agent_id: &str) -> String {
        format!("pat:{}:", agent_id)
    }

    /// Circuit breaker key
    pub fn breaker(agent_id: &str) -> String {
        format!("cb:{}", agent_id)
    }

    /// Escalation ticket key
    pub fn ticket(ticket_id: &str) -> String {
        format!("ticket:{}", ticket_id)
    }

    /// Prefix of all ticket keys
    pub const TICKET_PREFIX: &str = "ticket:";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        assert_eq!(keys::snapshot("abc"), "snap:abc");
        assert_eq!(keys::breaker("agent-1"), "cb:agent-1");
        assert_eq!(keys::ticket("t-1"), "ticket:t-1");
        assert_eq!(keys::history_sequence("a", "t"), "seq:a:t");
        assert_eq!(keys::loop_pattern("a", "ff00"), "pat:a:ff00");
    }

    #[test]
    fn test_history_key_ordering() {
        let k9 = keys::history_entry("a", "t", 9);
        let k10 = keys::history_entry("a", "t", 10);
        assert!(k9 < k10);
        assert!(k10.starts_with(&keys::history_prefix("a", "t")));
    }

    #[test]
    fn test_snapshot_index_roundtrip() {
        let key = keys::snapshot_index("a", "t", 1_000, "snap-1");
        assert!(key.starts_with(&keys::snapshot_index_prefix("a", "t")));
        assert_eq!(keys::parse_snapshot_index_id(&key), Some("snap-1"));
        assert!(keys::snapshot_index("a", "t", 999, "x") < key);
    }
}
