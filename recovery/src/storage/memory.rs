//! In-memory [`KvStore`] used by tests and single-process deployments

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::{KvStore, SharedStore};
use crate::error::{OpResult, OperationalError};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Namespaced ordered maps behind a single lock.
///
/// Expired entries are filtered on read and dropped on the next write to
/// their namespace.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    namespaces: RwLock<HashMap<String, BTreeMap<String, StoredValue>>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Simulate an outage: every call fails with `StorageUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live keys in a namespace
    pub fn len(&self, namespace: &str) -> usize {
        let now = Instant::now();
        self.namespaces
            .read()
            .map(|ns| {
                ns.get(namespace)
                    .map(|m| m.values().filter(|v| v.is_live(now)).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn check_available(&self, namespace: &str) -> OpResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OperationalError::storage(namespace, "store unavailable"));
        }
        Ok(())
    }
}

fn poisoned(namespace: &str) -> OperationalError {
    OperationalError::storage(namespace, "lock poisoned")
}

impl KvStore for InMemoryStore {
    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> OpResult<()> {
        self.check_available(namespace)?;
        let now = Instant::now();
        let mut guard = self.namespaces.write().map_err(|_| poisoned(namespace))?;
        let map = guard.entry(namespace.to_string()).or_default();
        map.retain(|_, v| v.is_live(now));
        map.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> OpResult<Option<Vec<u8>>> {
        self.check_available(namespace)?;
        let now = Instant::now();
        let guard = self.namespaces.read().map_err(|_| poisoned(namespace))?;
        Ok(guard
            .get(namespace)
            .and_then(|m| m.get(key))
            .filter(|v| v.is_live(now))
            .map(|v| v.bytes.clone()))
    }

    fn list(&self, namespace: &str, prefix: &str, limit: Option<usize>) -> OpResult<Vec<String>> {
        self.check_available(namespace)?;
        let now = Instant::now();
        let guard = self.namespaces.read().map_err(|_| poisoned(namespace))?;
        let Some(map) = guard.get(namespace) else {
            return Ok(Vec::new());
        };
        let iter = map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, _)| k.clone());
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> OpResult<()> {
        self.check_available(namespace)?;
        let mut guard = self.namespaces.write().map_err(|_| poisoned(namespace))?;
        if let Some(map) = guard.get_mut(namespace) {
            map.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStoreExt;

    #[test]
    fn test_put_get_delete() {
        let store = InMemoryStore::new();
        store.put("ns", "k1", b"v1".to_vec(), None).unwrap();
        assert_eq!(store.get("ns", "k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get("other", "k1").unwrap(), None);

        store.delete("ns", "k1").unwrap();
        assert_eq!(store.get("ns", "k1").unwrap(), None);
        // Missing key delete is fine
        store.delete("ns", "k1").unwrap();
    }

    #[test]
    fn test_list_prefix_ordered_and_limited() {
        let store = InMemoryStore::new();
        for key in ["b:2", "a:1", "b:1", "b:3", "c:1"] {
            store.put("ns", key, vec![], None).unwrap();
        }
        assert_eq!(store.list("ns", "b:", None).unwrap(), vec!["b:1", "b:2", "b:3"]);
        assert_eq!(store.list("ns", "b:", Some(2)).unwrap(), vec!["b:1", "b:2"]);
        assert!(store.list("missing", "", None).unwrap().is_empty());
    }

    #[test]
    fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .put("ns", "short", vec![1], Some(Duration::from_millis(0)))
            .unwrap();
        store.put("ns", "long", vec![2], None).unwrap();
        assert_eq!(store.get("ns", "short").unwrap(), None);
        assert_eq!(store.list("ns", "", None).unwrap(), vec!["long"]);
    }

    #[test]
    fn test_outage_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.put("snapshots", "k", vec![], None).unwrap_err();
        assert!(matches!(err, OperationalError::StorageUnavailable { .. }));
        assert!(store.get("snapshots", "k").is_err());
        store.set_unavailable(false);
        assert!(store.get("snapshots", "k").unwrap().is_none());
    }

    #[test]
    fn test_json_helpers() {
        let store = InMemoryStore::new();
        store.put_json("ns", "x:1", &vec![1, 2, 3]).unwrap();
        store.put("ns", "x:2", b"not json".to_vec(), None).unwrap();
        let got: Option<Vec<i32>> = store.get_json("ns", "x:1").unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));
        let all: Vec<Vec<i32>> = store.scan_json("ns", "x:").unwrap();
        assert_eq!(all.len(), 1);
    }
}
