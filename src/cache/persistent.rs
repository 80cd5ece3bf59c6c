//! Persistent cache variant.
//!
//! Namespaces every key with [`KEY_PREFIX`](super::KEY_PREFIX), restores
//! in-memory state from the backing store on construction, and tracks a
//! dirty set so `flush` writes only what changed. Descriptors gate writes
//! and removals; violations silently no-op.

use super::{Cache, CacheError, Descriptor, KEY_PREFIX};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Byte-level persistence contract the cache writes through.
pub trait Storage: Send + Sync {
    fn load(&self) -> Result<HashMap<String, Value>, CacheError>;
    fn read(&self, key: &str) -> Result<Option<Value>, CacheError>;
    fn write(&self, key: &str, value: &Value) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Single-file JSON object store.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_map(&self) -> Result<HashMap<String, Value>, CacheError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &HashMap<String, Value>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec(map)?)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<HashMap<String, Value>, CacheError> {
        self.read_map()
    }

    fn read(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.read_map()?.remove(key))
    }

    fn write(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.clone());
        self.write_map(&map)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Map-backed store. Shared behind an `Arc`, it stands in for the
/// cross-realm store in tests.
#[derive(Default)]
pub struct MemoryStorage {
    map: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<HashMap<String, Value>, CacheError> {
        Ok(self.map.read().clone())
    }

    fn read(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        self.map.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.map.write().remove(key);
        Ok(())
    }
}

struct Item {
    value: Value,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    items: HashMap<String, Item>,
    descriptors: HashMap<String, Descriptor>,
    dirty: HashSet<String>,
    removed: HashSet<String>,
}

pub struct PersistentCache {
    storage: Arc<dyn Storage>,
    state: RwLock<State>,
}

impl PersistentCache {
    /// Restore in-memory state from every namespaced key in the store.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let mut state = State::default();
        match storage.load() {
            Ok(entries) => {
                for (raw_key, value) in entries {
                    if let Some(key) = raw_key.strip_prefix(KEY_PREFIX) {
                        state.items.insert(
                            key.to_string(),
                            Item {
                                value,
                                created_at: Utc::now(),
                            },
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "cache restore failed, starting empty"),
        }
        Self {
            storage,
            state: RwLock::new(state),
        }
    }

    fn prefixed(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

impl Cache for PersistentCache {
    fn size(&self) -> usize {
        self.state.read().items.len()
    }

    fn get_item(&self, key: &str) -> Option<Value> {
        self.state.read().items.get(key).map(|i| i.value.clone())
    }

    fn get_persisted(&self, key: &str) -> Option<Value> {
        match self.storage.read(&Self::prefixed(key)) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "persisted read failed");
                None
            }
        }
    }

    fn set_item(&self, key: &str, value: Value, descriptor: Option<Descriptor>) {
        let mut state = self.state.write();
        match state.descriptors.get(key).copied() {
            Some(existing) => {
                if !existing.writable {
                    return;
                }
                if let Some(desc) = descriptor {
                    if existing.configurable {
                        state.descriptors.insert(key.to_string(), desc);
                    }
                }
            }
            None => {
                state
                    .descriptors
                    .insert(key.to_string(), descriptor.unwrap_or_default());
            }
        }
        state.items.insert(
            key.to_string(),
            Item {
                value,
                created_at: Utc::now(),
            },
        );
        state.removed.remove(key);
        state.dirty.insert(key.to_string());
    }

    fn remove_item(&self, key: &str) {
        let mut state = self.state.write();
        if let Some(desc) = state.descriptors.get(key) {
            if !desc.deletable {
                return;
            }
        }
        if state.items.remove(key).is_some() {
            state.descriptors.remove(key);
            state.dirty.remove(key);
            state.removed.insert(key.to_string());
        }
    }

    fn clear(&self) {
        let mut state = self.state.write();
        let deletable: Vec<String> = state
            .items
            .keys()
            .filter(|k| {
                state
                    .descriptors
                    .get(*k)
                    .map(|d| d.deletable)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for key in deletable {
            state.items.remove(&key);
            state.descriptors.remove(&key);
            state.dirty.remove(&key);
            state.removed.insert(key);
        }
    }

    fn define_cache_item(&self, key: &str, descriptor: Descriptor) {
        let mut state = self.state.write();
        if let Some(existing) = state.descriptors.get(key) {
            if !existing.configurable {
                return;
            }
        }
        state.descriptors.insert(key.to_string(), descriptor);
    }

    fn flush(&self) -> Result<(), CacheError> {
        let (dirty, removed): (Vec<(String, Value)>, Vec<String>) = {
            let state = self.state.read();
            (
                state
                    .dirty
                    .iter()
                    .filter_map(|k| state.items.get(k).map(|i| (k.clone(), i.value.clone())))
                    .collect(),
                state.removed.iter().cloned().collect(),
            )
        };
        for key in &removed {
            self.storage.delete(&Self::prefixed(key))?;
        }
        for (key, value) in &dirty {
            self.storage.write(&Self::prefixed(key), value)?;
        }
        let mut state = self.state.write();
        state.dirty.clear();
        state.removed.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared_store() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::new())
    }

    #[test]
    fn test_restore_from_backing_store() {
        let store = shared_store();
        store.write("_LDS_token", &json!("a.b.c")).unwrap();
        store.write("unrelated", &json!("ignored")).unwrap();

        let cache = PersistentCache::new(store);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get_string("token"), Some("a.b.c".to_string()));
    }

    #[test]
    fn test_flush_writes_only_dirty_keys() {
        let store = shared_store();
        let cache = PersistentCache::new(store.clone());

        cache.set_item("a", json!(1), None);
        cache.set_item("b", json!(2), None);
        cache.flush().unwrap();
        assert_eq!(store.read("_LDS_a").unwrap(), Some(json!(1)));
        assert_eq!(store.read("_LDS_b").unwrap(), Some(json!(2)));

        cache.remove_item("a");
        cache.flush().unwrap();
        assert_eq!(store.read("_LDS_a").unwrap(), None);
        assert_eq!(store.read("_LDS_b").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_non_writable_descriptor_drops_writes() {
        let cache = PersistentCache::new(shared_store());
        cache.set_item(
            "k",
            json!("first"),
            Some(Descriptor {
                configurable: false,
                deletable: true,
                writable: false,
            }),
        );
        cache.set_item("k", json!("second"), None);
        // Write was silently dropped; the previous value survives
        assert_eq!(cache.get_item("k"), Some(json!("first")));
    }

    #[test]
    fn test_non_deletable_descriptor_blocks_remove_and_clear() {
        let cache = PersistentCache::new(shared_store());
        cache.set_item(
            "pinned",
            json!(1),
            Some(Descriptor {
                configurable: false,
                deletable: false,
                writable: true,
            }),
        );
        cache.set_item("loose", json!(2), None);

        cache.remove_item("pinned");
        assert_eq!(cache.get_item("pinned"), Some(json!(1)));

        cache.clear();
        assert_eq!(cache.get_item("pinned"), Some(json!(1)));
        assert_eq!(cache.get_item("loose"), None);
    }

    #[test]
    fn test_non_configurable_descriptor_is_frozen() {
        let cache = PersistentCache::new(shared_store());
        cache.define_cache_item(
            "k",
            Descriptor {
                configurable: false,
                deletable: false,
                writable: true,
            },
        );
        // Redefinition must not take: the key stays non-deletable
        cache.define_cache_item("k", Descriptor::default());
        cache.set_item("k", json!(1), None);
        cache.remove_item("k");
        assert_eq!(cache.get_item("k"), Some(json!(1)));
    }

    #[test]
    fn test_get_persisted_sees_foreign_writes() {
        let store = shared_store();
        let ours = PersistentCache::new(store.clone());
        let theirs = PersistentCache::new(store);

        theirs.set_item("shared", json!(41), None);
        theirs.flush().unwrap();

        // In-memory copy is stale, read-through is not
        assert_eq!(ours.get_item("shared"), None);
        assert_eq!(ours.get_persisted("shared"), Some(json!(41)));
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let storage = FileStorage::new(&path);

        storage.write("_LDS_token", &json!("t")).unwrap();
        assert_eq!(storage.read("_LDS_token").unwrap(), Some(json!("t")));

        let restored = FileStorage::new(&path);
        assert_eq!(restored.load().unwrap().len(), 1);

        storage.delete("_LDS_token").unwrap();
        assert_eq!(storage.read("_LDS_token").unwrap(), None);
    }
}
