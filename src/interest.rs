//! Cross-tab interest registry.
//!
//! Reference-counts `(subject, bid)` pairs across every realm that shares
//! the persisted cache, so the backend hears about a business exactly once
//! while anyone is interested. Races between tabs are resolved by an
//! optimistic last-writer-wins rule: on each mutation both the persisted
//! and the in-memory record are read and the one with the greater version
//! wins. A truly concurrent multi-tab burst may over- or under-count by
//! one; `release` floors at zero and the record is deleted on zero, so a
//! stale server-side subscription never outlives the last release cycle.

use crate::cache::{keys, Cache};
use crate::protocol::Business;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Persisted per-business counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub reference: u32,
    pub version: u32,
}

pub struct InterestRegistry {
    cache: Arc<dyn Cache>,
    records: Mutex<HashMap<String, ReferenceRecord>>,
}

impl InterestRegistry {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn record_key(business: &Business) -> String {
        format!("{}{}", keys::WATCHED_BIZ, business.identity())
    }

    fn persisted_record(&self, key: &str) -> ReferenceRecord {
        self.cache
            .get_persisted(key)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Register one more watcher. Returns the merged reference count.
    pub async fn collect(&self, business: &Business) -> u32 {
        self.mutate(business, 1)
    }

    /// Drop one watcher. Returns the merged reference count; the record is
    /// deleted when it reaches zero.
    pub async fn release(&self, business: &Business) -> u32 {
        self.mutate(business, -1)
    }

    /// Current reference count without mutating anything.
    pub async fn get_reference(&self, business: &Business) -> u32 {
        let key = Self::record_key(business);
        let persisted = self.persisted_record(&key);
        let memory = self
            .records
            .lock()
            .get(&key)
            .copied()
            .unwrap_or_default();
        if persisted.version >= memory.version {
            persisted.reference
        } else {
            memory.reference
        }
    }

    fn mutate(&self, business: &Business, delta: i64) -> u32 {
        let key = Self::record_key(business);
        let persisted = self.persisted_record(&key);
        let memory = self
            .records
            .lock()
            .get(&key)
            .copied()
            .unwrap_or_default();

        // Higher version wins the merge.
        let base = if persisted.version >= memory.version {
            persisted
        } else {
            memory
        };

        let reference = (i64::from(base.reference) + delta).max(0) as u32;
        let record = ReferenceRecord {
            reference,
            version: base.version + 1,
        };

        if reference == 0 {
            self.cache.remove_item(&key);
        } else {
            match serde_json::to_value(record) {
                Ok(value) => self.cache.set_item(&key, value, None),
                Err(e) => warn!(%key, error = %e, "reference record encode failed"),
            }
        }
        // Cache trouble never propagates; the in-memory copy keeps counting.
        if let Err(e) = self.cache.flush() {
            warn!(%key, error = %e, "reference record flush failed");
        }

        self.records.lock().insert(key.clone(), record);
        debug!(%key, reference, version = record.version, "interest updated");
        reference
    }
}
