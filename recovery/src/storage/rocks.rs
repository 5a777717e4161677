//! RocksDB-backed [`KvStore`]
//!
//! Each namespace maps to a column family. Values are wrapped in a small
//! bincode envelope carrying the optional expiry so TTL survives restarts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};

use super::schema::ALL_NAMESPACES;
use super::{KvStore, SharedStore};
use crate::error::{OpResult, OperationalError};

#[derive(Serialize, Deserialize)]
struct Envelope {
    /// Unix millis after which the value is dead
    expires_at_ms: Option<i64>,
    bytes: Vec<u8>,
}

/// Persistent store with one column family per namespace
pub struct RocksStore {
    db: DB,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> OpResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_NAMESPACES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)
            .map_err(|e| OperationalError::storage("rocksdb", e.to_string()))?;

        Ok(Self { db, path })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn cf(&self, namespace: &str) -> OpResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(namespace)
            .ok_or_else(|| OperationalError::storage(namespace, "unknown namespace"))
    }

    fn decode(namespace: &str, raw: &[u8]) -> OpResult<Option<Vec<u8>>> {
        let (envelope, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(raw, bincode::config::standard())
                .map_err(|e| OperationalError::storage(namespace, e.to_string()))?;
        match envelope.expires_at_ms {
            Some(at) if Utc::now().timestamp_millis() >= at => Ok(None),
            _ => Ok(Some(envelope.bytes)),
        }
    }
}

impl KvStore for RocksStore {
    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> OpResult<()> {
        let cf = self.cf(namespace)?;
        let envelope = Envelope {
            expires_at_ms: ttl.map(|d| Utc::now().timestamp_millis() + d.as_millis() as i64),
            bytes: value,
        };
        let raw = bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
            .map_err(|e| OperationalError::Serialization(e.to_string()))?;
        self.db
            .put_cf(cf, key.as_bytes(), raw)
            .map_err(|e| OperationalError::storage(namespace, e.to_string()))
    }

    fn get(&self, namespace: &str, key: &str) -> OpResult<Option<Vec<u8>>> {
        let cf = self.cf(namespace)?;
        match self
            .db
            .get_cf(cf, key.as_bytes())
            .map_err(|e| OperationalError::storage(namespace, e.to_string()))?
        {
            Some(raw) => Self::decode(namespace, &raw),
            None => Ok(None),
        }
    }

    fn list(&self, namespace: &str, prefix: &str, limit: Option<usize>) -> OpResult<Vec<String>> {
        let cf = self.cf(namespace)?;
        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );

        for result in iter {
            if limit.is_some_and(|n| keys.len() >= n) {
                break;
            }
            let (key, value) = result.map_err(|e| OperationalError::storage(namespace, e.to_string()))?;
            let Ok(key_str) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            if !key_str.starts_with(prefix) {
                break; // Prefix no longer matches
            }
            if Self::decode(namespace, &value)?.is_some() {
                keys.push(key_str);
            }
        }

        Ok(keys)
    }

    fn delete(&self, namespace: &str, key: &str) -> OpResult<()> {
        let cf = self.cf(namespace)?;
        self.db
            .delete_cf(cf, key.as_bytes())
            .map_err(|e| OperationalError::storage(namespace, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::NS_HISTORY;
    use tempfile::tempdir;

    fn test_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("recovery.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_crud_and_prefix_listing() {
        let (store, _dir) = test_store();
        store.put(NS_HISTORY, "entry:a:t:1", b"one".to_vec(), None).unwrap();
        store.put(NS_HISTORY, "entry:a:t:2", b"two".to_vec(), None).unwrap();
        store.put(NS_HISTORY, "entry:b:t:1", b"other".to_vec(), None).unwrap();

        assert_eq!(
            store.get(NS_HISTORY, "entry:a:t:1").unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(
            store.list(NS_HISTORY, "entry:a:", None).unwrap(),
            vec!["entry:a:t:1", "entry:a:t:2"]
        );

        store.delete(NS_HISTORY, "entry:a:t:1").unwrap();
        assert_eq!(store.get(NS_HISTORY, "entry:a:t:1").unwrap(), None);
    }

    #[test]
    fn test_unknown_namespace_is_storage_error() {
        let (store, _dir) = test_store();
        let err = store.get("nope", "k").unwrap_err();
        assert!(matches!(err, OperationalError::StorageUnavailable { .. }));
    }

    #[test]
    fn test_expired_values_hidden() {
        let (store, _dir) = test_store();
        store
            .put(NS_HISTORY, "k", vec![1], Some(Duration::from_millis(0)))
            .unwrap();
        assert_eq!(store.get(NS_HISTORY, "k").unwrap(), None);
        assert!(store.list(NS_HISTORY, "", None).unwrap().is_empty());
    }
}
