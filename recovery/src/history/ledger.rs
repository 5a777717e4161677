//! The History Ledger

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::diff::{unified_diff, DiffResult};
use crate::canonical::to_canonical_pretty;
use crate::error::{OpResult, OperationalError};
use crate::retention::{select_expired, Retained, RetentionPolicy};
use crate::storage::schema::{keys, NS_HISTORY};
use crate::storage::{KvStoreExt, SharedStore};

/// Configuration for the History Ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Entries kept per agent across its tasks
    pub max_versions_per_agent: usize,
    pub retention_days: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_versions_per_agent: 100,
            retention_days: 30,
        }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> OpResult<()> {
        if self.max_versions_per_agent == 0 {
            return Err(OperationalError::config("history max_versions_per_agent must be > 0"));
        }
        Ok(())
    }

    fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.max_versions_per_agent,
            max_age: Duration::days(self.retention_days as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    State,
    Error,
    Intervention,
    Recovery,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Error => write!(f, "error"),
            Self::Intervention => write!(f, "intervention"),
            Self::Recovery => write!(f, "recovery"),
        }
    }
}

/// One versioned ledger record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub kind: EntryKind,
    /// Starts at 1 per agent/task, never reused
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Previous version of the same agent/task, `None` for version 1
    pub parent_version: Option<u64>,
}

impl Retained for HistoryEntry {
    fn retained_id(&self) -> &str {
        &self.id
    }

    fn retained_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: u64,
    pub entry_id: String,
    pub kind: EntryKind,
    pub timestamp: DateTime<Utc>,
}

/// Filter for [`HistoryLedger::query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub agent_id: String,
    pub task_id: Option<String>,
    pub kind: Option<EntryKind>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Last assigned version; `None` until loaded from storage
type Counter = Arc<Mutex<Option<u64>>>;

/// The History Ledger
///
/// Appends for one agent/task pair are serialized on that pair's counter
/// lock, so versions are gap-free and never interleave.
pub struct HistoryLedger {
    store: SharedStore,
    config: HistoryConfig,
    counters: DashMap<(String, String), Counter>,
}

impl HistoryLedger {
    pub fn new(store: SharedStore, config: HistoryConfig) -> Self {
        Self {
            store,
            config,
            counters: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    fn counter(&self, agent_id: &str, task_id: &str) -> Counter {
        self.counters
            .entry((agent_id.to_string(), task_id.to_string()))
            .or_default()
            .value()
            .clone()
    }

    /// Highest version ever assigned, from the sequence key and live entries
    fn load_sequence(&self, agent_id: &str, task_id: &str) -> OpResult<u64> {
        let stored: u64 = self
            .store
            .get_json(NS_HISTORY, &keys::history_sequence(agent_id, task_id))?
            .unwrap_or(0);
        let listed = self
            .store
            .list(NS_HISTORY, &keys::history_prefix(agent_id, task_id), None)?
            .iter()
            .filter_map(|k| k.rsplit(':').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(stored.max(listed))
    }

    /// Append an entry under the next version; returns the entry id.
    ///
    /// The entry is written before this returns. Retention runs afterwards
    /// and its failures are only logged.
    pub fn append(
        &self,
        agent_id: &str,
        task_id: &str,
        kind: EntryKind,
        data: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> OpResult<String> {
        Ok(self
            .append_at(agent_id, task_id, kind, data, metadata, Utc::now())?
            .id)
    }

    /// [`append`](Self::append) with an explicit timestamp, returning the entry
    pub fn append_at(
        &self,
        agent_id: &str,
        task_id: &str,
        kind: EntryKind,
        data: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> OpResult<HistoryEntry> {
        let counter = self.counter(agent_id, task_id);
        let entry = {
            let mut last = counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let current = match *last {
                Some(v) => v,
                None => self.load_sequence(agent_id, task_id)?,
            };
            let version = current + 1;
            let entry = HistoryEntry {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                kind,
                version,
                timestamp: now,
                data,
                metadata,
                parent_version: (version > 1).then(|| version - 1),
            };
            self.store.put_json(
                NS_HISTORY,
                &keys::history_entry(agent_id, task_id, version),
                &entry,
            )?;
            *last = Some(version);
            if let Err(e) = self.store.put_json(
                NS_HISTORY,
                &keys::history_sequence(agent_id, task_id),
                &version,
            ) {
                warn!(agent_id, task_id, version, error = %e, "Failed to persist history sequence");
            }
            entry
        };

        debug!(agent_id, task_id, version = entry.version, kind = %kind, "History entry appended");

        if let Err(e) = self.prune_agent(agent_id, Utc::now().max(now)) {
            warn!(agent_id, error = %e, "History pruning failed");
        }
        Ok(entry)
    }

    /// Apply count and age limits to one agent's entries, oldest first
    pub fn prune_agent(&self, agent_id: &str, now: DateTime<Utc>) -> OpResult<usize> {
        let entries: Vec<HistoryEntry> = self
            .store
            .scan_json(NS_HISTORY, &keys::history_agent_prefix(agent_id))?;
        let expired = select_expired(&entries, &self.config.policy(), now);
        for id in &expired {
            if let Some(e) = entries.iter().find(|e| &e.id == id) {
                self.store.delete(
                    NS_HISTORY,
                    &keys::history_entry(&e.agent_id, &e.task_id, e.version),
                )?;
            }
        }
        if !expired.is_empty() {
            debug!(agent_id, pruned = expired.len(), "Pruned history entries");
        }
        Ok(expired.len())
    }

    /// Entries matching `query`, newest first
    pub fn query(&self, query: &HistoryQuery) -> OpResult<Vec<HistoryEntry>> {
        let prefix = match &query.task_id {
            Some(task_id) => keys::history_prefix(&query.agent_id, task_id),
            None => keys::history_agent_prefix(&query.agent_id),
        };
        let mut entries: Vec<HistoryEntry> = self
            .store
            .scan_json::<HistoryEntry>(NS_HISTORY, &prefix)?
            .into_iter()
            .filter(|e| query.kind.map_or(true, |k| e.kind == k))
            .filter(|e| query.since.map_or(true, |s| e.timestamp >= s))
            .collect();
        entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.version.cmp(&a.version))
        });
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Live versions of an agent/task pair, ascending
    pub fn versions(&self, agent_id: &str, task_id: &str) -> OpResult<Vec<VersionSummary>> {
        let entries: Vec<HistoryEntry> = self
            .store
            .scan_json(NS_HISTORY, &keys::history_prefix(agent_id, task_id))?;
        let mut versions: Vec<VersionSummary> = entries
            .into_iter()
            .map(|e| VersionSummary {
                version: e.version,
                entry_id: e.id,
                kind: e.kind,
                timestamp: e.timestamp,
            })
            .collect();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    pub fn get(&self, agent_id: &str, task_id: &str, version: u64) -> OpResult<HistoryEntry> {
        self.store
            .get_json(NS_HISTORY, &keys::history_entry(agent_id, task_id, version))?
            .ok_or_else(|| {
                OperationalError::not_found("history entry", format!("{}/{}@{}", agent_id, task_id, version))
            })
    }

    /// Line diff between the canonical data of two versions
    pub fn diff(
        &self,
        agent_id: &str,
        task_id: &str,
        version_a: u64,
        version_b: u64,
    ) -> OpResult<DiffResult> {
        let a = self.get(agent_id, task_id, version_a)?;
        let b = self.get(agent_id, task_id, version_b)?;
        Ok(unified_diff(
            &to_canonical_pretty(&a.data),
            &to_canonical_pretty(&b.data),
            version_a,
            version_b,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use serde_json::json;

    fn ledger(config: HistoryConfig) -> HistoryLedger {
        HistoryLedger::new(InMemoryStore::new().shared(), config)
    }

    fn append(l: &HistoryLedger, task: &str, data: serde_json::Value) -> HistoryEntry {
        l.append_at("a", task, EntryKind::State, data, HashMap::new(), Utc::now())
            .unwrap()
    }

    #[test]
    fn test_versions_start_at_one() {
        let l = ledger(HistoryConfig::default());
        let e1 = append(&l, "t", json!({"n": 1}));
        let e2 = append(&l, "t", json!({"n": 2}));
        let other = append(&l, "u", json!({}));
        assert_eq!((e1.version, e1.parent_version), (1, None));
        assert_eq!((e2.version, e2.parent_version), (2, Some(1)));
        assert_eq!(other.version, 1);
        let versions: Vec<u64> = l.versions("a", "t").unwrap().iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_versions_not_reused_after_prune() {
        let store = InMemoryStore::new().shared();
        let l = HistoryLedger::new(
            store.clone(),
            HistoryConfig {
                max_versions_per_agent: 2,
                ..Default::default()
            },
        );
        let base = Utc::now() - Duration::minutes(5);
        for i in 0..5 {
            l.append_at("a", "t", EntryKind::State, json!(i), HashMap::new(), base + Duration::seconds(i))
                .unwrap();
        }
        let versions: Vec<u64> = l.versions("a", "t").unwrap().iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![4, 5]);

        // A new ledger over the same store continues the sequence
        let restarted = HistoryLedger::new(store, HistoryConfig::default());
        let e = restarted
            .append_at("a", "t", EntryKind::State, json!(6), HashMap::new(), Utc::now())
            .unwrap();
        assert_eq!(e.version, 6);
    }

    #[test]
    fn test_prune_by_age() {
        let l = ledger(HistoryConfig::default());
        let old = l
            .append_at("a", "t", EntryKind::Error, json!("old"), HashMap::new(), Utc::now() - Duration::days(31))
            .unwrap();
        append(&l, "t", json!("new"));
        assert!(l.get("a", "t", old.version).is_err());
        assert_eq!(l.versions("a", "t").unwrap().len(), 1);
    }

    #[test]
    fn test_query_filters_newest_first() {
        let l = ledger(HistoryConfig::default());
        let base = Utc::now() - Duration::minutes(10);
        l.append_at("a", "t", EntryKind::State, json!(1), HashMap::new(), base).unwrap();
        l.append_at("a", "t", EntryKind::Error, json!(2), HashMap::new(), base + Duration::minutes(1))
            .unwrap();
        l.append_at("a", "u", EntryKind::Recovery, json!(3), HashMap::new(), base + Duration::minutes(2))
            .unwrap();
        l.append_at("b", "t", EntryKind::State, json!(4), HashMap::new(), base).unwrap();

        let all = l.query(&HistoryQuery::agent("a")).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, EntryKind::Recovery);

        let task = l.query(&HistoryQuery::agent("a").task("t")).unwrap();
        assert_eq!(task.len(), 2);
        assert_eq!(task[0].version, 2);

        let errors = l.query(&HistoryQuery::agent("a").kind(EntryKind::Error)).unwrap();
        assert_eq!(errors.len(), 1);

        let recent = l
            .query(&HistoryQuery::agent("a").since(base + Duration::seconds(30)).limit(1))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, EntryKind::Recovery);
    }

    #[test]
    fn test_diff_ignores_key_order() {
        let l = ledger(HistoryConfig::default());
        let v1: serde_json::Value = serde_json::from_str(r#"{"b": 1, "a": "x", "c": [1, 2]}"#).unwrap();
        let v2: serde_json::Value = serde_json::from_str(r#"{"a": "x", "c": [1, 3], "b": 1}"#).unwrap();
        append(&l, "t", v1.clone());
        append(&l, "t", v2);
        append(&l, "t", v1);

        let d = l.diff("a", "t", 1, 2).unwrap();
        assert_eq!(d.additions, 1);
        assert_eq!(d.deletions, 1);
        assert!(d.lines.contains(&"-    2".to_string()));
        assert!(d.lines.contains(&"+    3".to_string()));
        assert_eq!(l.diff("a", "t", 1, 3).unwrap().total_changes, 0);
        assert!(l.diff("a", "t", 1, 9).is_err());
    }

    #[test]
    fn test_concurrent_appends_are_gap_free() {
        let l = Arc::new(ledger(HistoryConfig {
            max_versions_per_agent: 1000,
            ..Default::default()
        }));
        std::thread::scope(|s| {
            for w in 0..8 {
                let l = l.clone();
                s.spawn(move || {
                    for i in 0..25 {
                        l.append("a", "t", EntryKind::State, json!({ "w": w, "i": i }), HashMap::new())
                            .unwrap();
                    }
                });
            }
        });
        let versions: Vec<u64> = l.versions("a", "t").unwrap().iter().map(|v| v.version).collect();
        assert_eq!(versions, (1..=200).collect::<Vec<u64>>());
    }
}
