//! Snapshot Store: checksummed state snapshots per agent/task
//!
//! Snapshots are taken by the caller before risky operations and restored by
//! [`SnapshotStore::rollback`]. The checksum is recomputed on every restore;
//! a mismatch fails with [`OperationalError::Integrity`] and nothing is
//! returned. Each create prunes the agent's snapshots by count and age.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canonical::{checksum, to_canonical_string};
use crate::error::{OpResult, OperationalError};
use crate::retention::{select_expired, Retained, RetentionPolicy};
use crate::storage::schema::{keys, NS_SNAPSHOTS};
use crate::storage::{KvStoreExt, SharedStore};

/// Configuration for the Snapshot Store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshots kept per agent, newest win
    pub max_per_agent: usize,
    /// Age after which snapshots are pruned
    pub retention_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_per_agent: 10,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl SnapshotConfig {
    pub fn validate(&self) -> OpResult<()> {
        if self.max_per_agent == 0 {
            return Err(OperationalError::config("snapshot max_per_agent must be > 0"));
        }
        Ok(())
    }

    fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.max_per_agent,
            max_age: Duration::seconds(self.retention_secs as i64),
        }
    }
}

/// A stored copy of task state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    /// Canonical JSON of the state
    pub state_blob: String,
    /// BLAKE3 of `state_blob`
    pub checksum: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Snapshot {
    /// Recompute the checksum and compare with the stored one
    pub fn verify(&self) -> OpResult<()> {
        let actual = checksum(self.state_blob.as_bytes());
        if actual != self.checksum {
            return Err(OperationalError::Integrity {
                snapshot_id: self.id.clone(),
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            task_id: self.task_id.clone(),
            created_at: self.created_at,
            checksum: self.checksum.clone(),
            size_bytes: self.state_blob.len(),
        }
    }
}

/// Listing entry without the state blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    pub size_bytes: usize,
}

impl SnapshotSummary {
    fn index_key(&self) -> String {
        keys::snapshot_index(
            &self.agent_id,
            &self.task_id,
            self.created_at.timestamp_nanos_opt().unwrap_or(0),
            &self.id,
        )
    }
}

impl Retained for SnapshotSummary {
    fn retained_id(&self) -> &str {
        &self.id
    }

    fn retained_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// The Snapshot Store
pub struct SnapshotStore {
    store: SharedStore,
    config: SnapshotConfig,
}

impl SnapshotStore {
    pub fn new(store: SharedStore, config: SnapshotConfig) -> Self {
        Self { store, config }
    }

    /// Snapshot `state` and prune the agent's older snapshots
    pub fn create(
        &self,
        agent_id: &str,
        task_id: &str,
        state: &serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> OpResult<String> {
        self.create_at(agent_id, task_id, state, metadata, Utc::now())
    }

    /// [`create`](Self::create) with an explicit creation time
    pub fn create_at(
        &self,
        agent_id: &str,
        task_id: &str,
        state: &serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> OpResult<String> {
        let state_blob = to_canonical_string(state);
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            created_at: now,
            checksum: checksum(state_blob.as_bytes()),
            state_blob,
            metadata,
        };
        let summary = snapshot.summary();

        self.store
            .put_json(NS_SNAPSHOTS, &keys::snapshot(&snapshot.id), &snapshot)?;
        self.store
            .put_json(NS_SNAPSHOTS, &summary.index_key(), &summary)?;

        info!(
            agent_id,
            task_id,
            snapshot_id = %snapshot.id,
            size_bytes = summary.size_bytes,
            "Snapshot created"
        );

        let pruned = self.prune_agent(agent_id, Utc::now().max(now))?;
        if pruned > 0 {
            debug!(agent_id, pruned, "Pruned old snapshots");
        }
        Ok(snapshot.id)
    }

    /// Fetch a snapshot by id
    pub fn get(&self, snapshot_id: &str) -> OpResult<Snapshot> {
        self.store
            .get_json(NS_SNAPSHOTS, &keys::snapshot(snapshot_id))?
            .ok_or_else(|| OperationalError::not_found("snapshot", snapshot_id))
    }

    /// Snapshots for an agent/task pair, newest first
    pub fn list(
        &self,
        agent_id: &str,
        task_id: &str,
        limit: Option<usize>,
    ) -> OpResult<Vec<SnapshotSummary>> {
        let mut summaries: Vec<SnapshotSummary> = self
            .store
            .scan_json(NS_SNAPSHOTS, &keys::snapshot_index_prefix(agent_id, task_id))?;
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    /// Most recent snapshot for an agent/task pair
    pub fn latest(&self, agent_id: &str, task_id: &str) -> OpResult<Option<SnapshotSummary>> {
        Ok(self.list(agent_id, task_id, Some(1))?.into_iter().next())
    }

    /// Check a snapshot's integrity without restoring it
    pub fn verify(&self, snapshot_id: &str) -> OpResult<()> {
        self.get(snapshot_id)?.verify()
    }

    /// Return the verified state of a snapshot.
    ///
    /// Read-only: applying the state to the live task is the caller's job.
    pub fn rollback(&self, snapshot_id: &str) -> OpResult<serde_json::Value> {
        let snapshot = self.get(snapshot_id)?;
        if let Err(e) = snapshot.verify() {
            warn!(
                snapshot_id,
                agent_id = %snapshot.agent_id,
                "Refusing rollback to corrupted snapshot"
            );
            return Err(e);
        }
        let state = serde_json::from_str(&snapshot.state_blob)?;
        info!(snapshot_id, agent_id = %snapshot.agent_id, task_id = %snapshot.task_id, "Rollback state restored");
        Ok(state)
    }

    /// Delete a snapshot and its index entry
    pub fn delete(&self, snapshot_id: &str) -> OpResult<()> {
        let snapshot = self.get(snapshot_id)?;
        self.remove(&snapshot.summary())
    }

    fn remove(&self, summary: &SnapshotSummary) -> OpResult<()> {
        self.store.delete(NS_SNAPSHOTS, &summary.index_key())?;
        self.store.delete(NS_SNAPSHOTS, &keys::snapshot(&summary.id))?;
        debug!(snapshot_id = %summary.id, agent_id = %summary.agent_id, "Snapshot deleted");
        Ok(())
    }

    /// Apply count and age limits to one agent's snapshots
    pub fn prune_agent(&self, agent_id: &str, now: DateTime<Utc>) -> OpResult<usize> {
        let summaries: Vec<SnapshotSummary> = self
            .store
            .scan_json(NS_SNAPSHOTS, &keys::snapshot_index_agent_prefix(agent_id))?;
        let expired = select_expired(&summaries, &self.config.policy(), now);
        for id in &expired {
            if let Some(summary) = summaries.iter().find(|s| &s.id == id) {
                self.remove(summary)?;
            }
        }
        Ok(expired.len())
    }
}
