//! Credential and key storage capability.
//!
//! The subprocess keeps no durable state of its own: it asks the host for
//! its credentials and signal keys over reverse RPC, and the host answers
//! through a [`Store`]. Values are opaque [`Payload`] blobs that a store
//! persists and returns without looking inside.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::payload::Payload;

/// Batched key mutations: `type -> id -> value`, where `None` deletes the key.
pub type KeyChanges = BTreeMap<String, BTreeMap<String, Option<Payload>>>;

/// Errors raised by a [`Store`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Backend(String),
}

/// Persistence backend for credentials and keys.
///
/// Calls are made from the connection's processing loop, one at a time per
/// connection, so implementations should return promptly.
pub trait Store: Send + Sync {
    /// Load the stored credentials, if any were saved.
    fn load_creds(&self) -> Result<Option<Payload>, StoreError>;

    /// Replace the stored credentials.
    fn save_creds(&self, creds: Payload) -> Result<(), StoreError>;

    /// Fetch keys of `kind`. Ids with no stored value are omitted.
    fn get(&self, kind: &str, ids: &[String]) -> Result<BTreeMap<String, Payload>, StoreError>;

    /// Apply a batch of writes and deletions.
    fn set(&self, changes: KeyChanges) -> Result<(), StoreError>;
}

/// Process-local [`Store`] that forgets everything on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    creds: Mutex<Option<Payload>>,
    keys: Mutex<BTreeMap<String, BTreeMap<String, Payload>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with credentials.
    pub fn with_creds(creds: Payload) -> Self {
        Self {
            creds: Mutex::new(Some(creds)),
            keys: Mutex::default(),
        }
    }

    /// Current credentials, for inspection.
    pub fn creds(&self) -> Option<Payload> {
        self.creds.lock().ok().and_then(|c| c.clone())
    }

    /// A single stored key, for inspection.
    pub fn key(&self, kind: &str, id: &str) -> Option<Payload> {
        self.keys
            .lock()
            .ok()
            .and_then(|keys| keys.get(kind).and_then(|ids| ids.get(id)).cloned())
    }

    /// Number of stored keys across all types.
    pub fn key_count(&self) -> usize {
        self.keys
            .lock()
            .map(|keys| keys.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
}

impl Store for MemoryStore {
    fn load_creds(&self) -> Result<Option<Payload>, StoreError> {
        Ok(lock(&self.creds)?.clone())
    }

    fn save_creds(&self, creds: Payload) -> Result<(), StoreError> {
        *lock(&self.creds)? = Some(creds);
        Ok(())
    }

    fn get(&self, kind: &str, ids: &[String]) -> Result<BTreeMap<String, Payload>, StoreError> {
        let keys = lock(&self.keys)?;
        let Some(stored) = keys.get(kind) else {
            return Ok(BTreeMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id).map(|value| (id.clone(), value.clone())))
            .collect())
    }

    fn set(&self, changes: KeyChanges) -> Result<(), StoreError> {
        let mut keys = lock(&self.keys)?;
        for (kind, entries) in changes {
            let stored = keys.entry(kind).or_default();
            for (id, value) in entries {
                match value {
                    Some(value) => {
                        stored.insert(id, value);
                    }
                    None => {
                        stored.remove(&id);
                    }
                }
            }
        }
        keys.retain(|_, ids| !ids.is_empty());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn changes(kind: &str, entries: &[(&str, Option<Payload>)]) -> KeyChanges {
        let mut inner = BTreeMap::new();
        for (id, value) in entries {
            inner.insert((*id).to_string(), value.clone());
        }
        let mut outer = BTreeMap::new();
        outer.insert(kind.to_string(), inner);
        outer
    }

    #[test]
    fn creds_start_empty_and_persist() {
        let store = MemoryStore::new();
        assert!(store.load_creds().unwrap().is_none());
        store.save_creds(Payload::Bytes(vec![1, 2])).unwrap();
        assert_eq!(store.load_creds().unwrap(), Some(Payload::Bytes(vec![1, 2])));
    }

    #[test]
    fn get_omits_absent_ids() {
        let store = MemoryStore::new();
        store
            .set(changes("pre-key", &[("1", Some(Payload::from("a")))]))
            .unwrap();

        let found = store
            .get("pre-key", &["1".to_string(), "2".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("1"), Some(&Payload::from("a")));
        assert!(!found.contains_key("2"));

        assert!(store.get("session", &["1".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn set_with_none_deletes() {
        let store = MemoryStore::new();
        store
            .set(changes(
                "session",
                &[("a", Some(Payload::from("x"))), ("b", Some(Payload::from("y")))],
            ))
            .unwrap();
        store.set(changes("session", &[("a", None)])).unwrap();

        assert!(store.key("session", "a").is_none());
        assert_eq!(store.key("session", "b"), Some(Payload::from("y")));
        assert_eq!(store.key_count(), 1);
    }
}
