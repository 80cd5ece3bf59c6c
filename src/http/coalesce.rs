//! In-flight GET coalescing.
//!
//! Many components asking the same thing at once naturally produce
//! duplicate GETs. Identical requests issued within the window share one
//! wire call and observe the same resolution.

use super::{HttpError, HttpPayload};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a cached in-flight promise stays reusable.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(500);

pub type ResponseFuture = Shared<BoxFuture<'static, Result<HttpPayload, HttpError>>>;

struct Entry {
    created_at: Instant,
    future: ResponseFuture,
}

pub struct InflightCache {
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InflightCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached future when one exists and is fresher than the
    /// window, otherwise build, cache, and return a new one. The bool is
    /// true when a new wire call was started.
    pub fn get_or_insert<F>(&self, key: String, make: F) -> (ResponseFuture, bool)
    where
        F: FnOnce() -> BoxFuture<'static, Result<HttpPayload, HttpError>>,
    {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.created_at.elapsed() < self.window);
        if let Some(entry) = entries.get(&key) {
            return (entry.future.clone(), false);
        }
        let future = make().shared();
        entries.insert(
            key,
            Entry {
                created_at: Instant::now(),
                future: future.clone(),
            },
        );
        (future, true)
    }
}

impl Default for InflightCache {
    fn default() -> Self {
        Self::new(COALESCE_WINDOW)
    }
}

/// Content hash over everything that identifies a request.
pub fn request_hash(method: &str, url: &str, params: &Map<String, Value>, signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(Value::Object(params.clone()).to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(signature.as_bytes());
    format!("{:x}", hasher.finalize())
}
