//! Namespaced key-value cache with per-key write/delete policy.
//!
//! Two variants share one contract: a persistent cache that namespaces keys
//! and writes through a [`Storage`] backend, and a plain in-memory map.
//! Credentials, broker coordinates, and the cross-tab interest records all
//! live here.

use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod persistent;

pub use memory::MemoryCache;
pub use persistent::{FileStorage, MemoryStorage, PersistentCache, Storage};

/// Namespace prefix applied to every persisted key.
pub const KEY_PREFIX: &str = "_LDS_";

/// Well-known cache keys.
pub mod keys {
    pub const TOKEN: &str = "token";
    pub const MQTT_PASSWORD: &str = "mqttPassword";
    pub const MQTT_UUID: &str = "mqttUuid";
    pub const CLIENT_ID: &str = "clientId";
    pub const MQTT_HOST: &str = "mqttHost";
    pub const MQTT_HOST_PROTOCOL: &str = "mqttHostProtocol";
    /// Per-business interest records live under `{WATCHED_BIZ}{identity}`.
    pub const WATCHED_BIZ: &str = "mqttWatchedBiz_";
}

/// Per-key policy. A non-configurable descriptor can never be replaced;
/// writes and removals that violate `writable`/`deletable` silently no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub configurable: bool,
    pub deletable: bool,
    pub writable: bool,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            configurable: false,
            deletable: true,
            writable: true,
        }
    }
}

impl Descriptor {
    pub fn frozen() -> Self {
        Self {
            configurable: false,
            deletable: false,
            writable: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage I/O failed")]
    Io(#[from] std::io::Error),
    #[error("storage serialization failed")]
    Serde(#[from] serde_json::Error),
}

/// Shared cache contract.
pub trait Cache: Send + Sync {
    fn size(&self) -> usize;

    fn get_item(&self, key: &str) -> Option<Value>;

    /// Read through to the backing store, bypassing this process's
    /// in-memory copy. For the memory variant this is `get_item`. Used
    /// where another realm may have written the key since our last read.
    fn get_persisted(&self, key: &str) -> Option<Value>;

    /// Write a value. An explicit descriptor applies only when the key has
    /// no non-configurable descriptor yet.
    fn set_item(&self, key: &str, value: Value, descriptor: Option<Descriptor>);

    fn remove_item(&self, key: &str);

    /// Remove every deletable key.
    fn clear(&self);

    fn define_cache_item(&self, key: &str, descriptor: Descriptor);

    /// Write dirtied and removed keys through to the backing store.
    fn flush(&self) -> Result<(), CacheError>;

    fn get_string(&self, key: &str) -> Option<String> {
        self.get_item(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }
}
