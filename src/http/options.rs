//! Per-request options and the terminal/user-agent classification.

use futures::future::AbortHandle;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header names the caller may not override.
pub const RESERVED_HEADERS: [&str; 3] = ["access-token", "terminal", "token"];

/// Default service prefix under the API base.
pub const DEFAULT_API_PREFIX: &str = "building";

/// Default request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 50_000;

/// Expected body shape of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    ArrayBuffer,
    Blob,
    Document,
    #[default]
    Json,
    Text,
    Stream,
}

impl ResponseType {
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            ResponseType::ArrayBuffer | ResponseType::Blob | ResponseType::Stream
        )
    }
}

/// Terminal class reported to the backend, derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Web,
    App,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Web => "WEB",
            Terminal::App => "APP",
        }
    }
}

/// Mobile user agents report `APP`, everything else `WEB`.
pub fn terminal_for_user_agent(user_agent: &str) -> Terminal {
    let ua = user_agent.to_lowercase();
    if ["android", "iphone", "ipad", "mobile"]
        .iter()
        .any(|m| ua.contains(m))
    {
        Terminal::App
    } else {
        Terminal::Web
    }
}

type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Cooperative cancellation for one request. Cancelling resolves the call
/// with the dedicated canceled error; it never fires listener side effects.
#[derive(Clone, Default)]
pub struct CancelHandle {
    aborter: Arc<Mutex<Option<AbortHandle>>>,
    canceled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.aborter.lock().as_ref() {
            handle.abort();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn bind(&self, handle: AbortHandle) {
        if self.is_canceled() {
            handle.abort();
        }
        *self.aborter.lock() = Some(handle);
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Options accepted by every verb.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Service prefix under the API base; `None` uses the default prefix.
    pub api_change: Option<String>,
    /// Extra headers. Reserved names are dropped at ingestion.
    pub headers: Vec<(String, String)>,
    /// Suppress the `_r=<random>` cache-buster query parameter.
    pub hide_times: bool,
    /// Absent or `true`: non-success responses resolve with the failure
    /// payload. `false`: they reject.
    pub is_catch: Option<bool>,
    pub response_type: ResponseType,
    /// Milliseconds; the default is applied when `None`.
    pub timeout_ms: Option<u64>,
    pub using_form_data: bool,
    pub using_blob: bool,
    pub cancel: Option<CancelHandle>,
    pub on_download_progress: Option<ProgressFn>,
    pub on_upload_progress: Option<ProgressFn>,
}

impl RequestOptions {
    pub fn catches(&self) -> bool {
        self.is_catch.unwrap_or(true)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn api_prefix(&self) -> &str {
        self.api_change.as_deref().unwrap_or(DEFAULT_API_PREFIX)
    }

    /// Headers with reserved names dropped.
    pub fn extra_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(name, _)| {
                !RESERVED_HEADERS
                    .iter()
                    .any(|r| name.eq_ignore_ascii_case(r))
            })
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Stable fingerprint of everything that shapes the wire request beyond
    /// method, url, and params. Feeds the in-flight cache key.
    pub fn cache_signature(&self) -> String {
        let mut headers: Vec<String> = self
            .extra_headers()
            .map(|(n, v)| format!("{n}={v}"))
            .collect();
        headers.sort();
        format!(
            "prefix={};rt={:?};buster={};headers={}",
            self.api_prefix(),
            self.response_type,
            !self.hide_times,
            headers.join(",")
        )
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("api_change", &self.api_change)
            .field("hide_times", &self.hide_times)
            .field("is_catch", &self.is_catch)
            .field("response_type", &self.response_type)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert_eq!(
            terminal_for_user_agent("Mozilla/5.0 (X11; Linux x86_64)"),
            Terminal::Web
        );
        assert_eq!(
            terminal_for_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)"),
            Terminal::App
        );
        assert_eq!(
            terminal_for_user_agent("Mozilla/5.0 (Linux; Android 14) Mobile"),
            Terminal::App
        );
        assert_eq!(Terminal::Web.as_str(), "WEB");
        assert_eq!(Terminal::App.as_str(), "APP");
    }

    #[test]
    fn test_reserved_headers_dropped() {
        let options = RequestOptions {
            headers: vec![
                ("Access-Token".to_string(), "spoofed".to_string()),
                ("token".to_string(), "spoofed".to_string()),
                ("TERMINAL".to_string(), "spoofed".to_string()),
                ("x-trace".to_string(), "t1".to_string()),
            ],
            ..Default::default()
        };
        let kept: Vec<_> = options.extra_headers().collect();
        assert_eq!(kept, vec![("x-trace", "t1")]);
    }

    #[test]
    fn test_defaults() {
        let options = RequestOptions::default();
        assert!(options.catches());
        assert_eq!(options.timeout_ms(), 50_000);
        assert_eq!(options.api_prefix(), "building");
        assert_eq!(options.response_type, ResponseType::Json);
    }

    #[test]
    fn test_is_catch_false_rejects() {
        let options = RequestOptions {
            is_catch: Some(false),
            ..Default::default()
        };
        assert!(!options.catches());
    }

    #[test]
    fn test_cancel_handle_before_bind() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        assert!(cancel.is_canceled());

        // Binding after the fact aborts immediately
        let (handle, _registration) = AbortHandle::new_pair();
        cancel.bind(handle.clone());
        assert!(handle.is_aborted());
    }

    #[test]
    fn test_cache_signature_is_order_insensitive_for_headers() {
        let a = RequestOptions {
            headers: vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
            ..Default::default()
        };
        let b = RequestOptions {
            headers: vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
            ..Default::default()
        };
        assert_eq!(a.cache_signature(), b.cache_signature());
    }
}
