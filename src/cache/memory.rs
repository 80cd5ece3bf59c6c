//! In-memory cache variant: a straight mapping with no descriptor logic.

use super::{Cache, CacheError, Descriptor};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryCache {
    items: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn size(&self) -> usize {
        self.items.read().len()
    }

    fn get_item(&self, key: &str) -> Option<Value> {
        self.items.read().get(key).cloned()
    }

    fn get_persisted(&self, key: &str) -> Option<Value> {
        self.get_item(key)
    }

    fn set_item(&self, key: &str, value: Value, _descriptor: Option<Descriptor>) {
        self.items.write().insert(key.to_string(), value);
    }

    fn remove_item(&self, key: &str) {
        self.items.write().remove(key);
    }

    fn clear(&self) {
        self.items.write().clear();
    }

    fn define_cache_item(&self, _key: &str, _descriptor: Descriptor) {}

    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
