//! Storage contract for the recovery core
//!
//! Every stateful component persists through [`KvStore`], a namespaced
//! key-value contract with prefix listing and optional TTL. The backing
//! engine is an external collaborator; this module ships an in-memory
//! implementation and, behind the `rocksdb-backend` feature, a RocksDB one.
//!
//! # Namespaces
//!
//! - `snapshots`: state snapshots and their per-agent index
//! - `history`: versioned ledger entries and sequence counters
//! - `loop_patterns`: detected loop patterns
//! - `circuit_breakers`: per-agent breaker state
//! - `escalations`: escalation tickets

pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{OpResult, OperationalError};

pub use memory::InMemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

/// Shared reference to a storage backend
pub type SharedStore = Arc<dyn KvStore>;

/// Durable namespaced key-value store
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`; `ttl` expires the entry after the duration
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> OpResult<()>;

    /// Fetch the value for `key`, `None` when absent or expired
    fn get(&self, namespace: &str, key: &str) -> OpResult<Option<Vec<u8>>>;

    /// Keys starting with `prefix` in ascending order, at most `limit`
    fn list(&self, namespace: &str, prefix: &str, limit: Option<usize>) -> OpResult<Vec<String>>;

    /// Remove `key`; deleting a missing key is not an error
    fn delete(&self, namespace: &str, key: &str) -> OpResult<()>;
}

/// JSON helpers over any [`KvStore`]
pub trait KvStoreExt: KvStore {
    /// Serialize `value` as JSON and store it
    fn put_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> OpResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| OperationalError::Serialization(e.to_string()))?;
        self.put(namespace, key, bytes, None)
    }

    /// Fetch and deserialize a JSON value
    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> OpResult<Option<T>> {
        match self.get(namespace, key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| OperationalError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Fetch every JSON value under `prefix`, skipping undecodable entries
    fn scan_json<T: DeserializeOwned>(&self, namespace: &str, prefix: &str) -> OpResult<Vec<T>> {
        let keys = self.list(namespace, prefix, None)?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_json::<T>(namespace, &key) {
                Ok(Some(v)) => values.push(v),
                Ok(None) => {}
                Err(OperationalError::Serialization(e)) => {
                    tracing::warn!(namespace, key = %key, "Skipping undecodable record: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}
