//! Structured HTTP client with middleware chains and in-flight GET
//! coalescing.

use serde_json::Value;
use thiserror::Error;

pub mod client;
pub mod coalesce;
pub mod envelope;
pub mod middleware;
pub mod options;

pub use client::{ApiBase, HttpClient, HttpSettings};
pub use envelope::{ApiEnvelope, FORBIDDEN_CODE};
pub use middleware::{AfterFn, AfterReturning, BeforeFn, BeforeRequest, RequestContext, Verdict};
pub use options::{
    terminal_for_user_agent, CancelHandle, RequestOptions, ResponseType, Terminal,
};

/// Status code attached to user-canceled requests.
pub const CANCELED_CODE: i64 = 499;

/// Resolved body of a call, shaped by the requested response type.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpPayload {
    Envelope(ApiEnvelope),
    Text(String),
    Bytes(Vec<u8>),
}

impl HttpPayload {
    pub fn envelope(&self) -> Option<&ApiEnvelope> {
        match self {
            HttpPayload::Envelope(env) => Some(env),
            _ => None,
        }
    }

    pub fn into_envelope(self) -> Option<ApiEnvelope> {
        match self {
            HttpPayload::Envelope(env) => Some(env),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HttpError {
    /// The caller canceled; never triggers listener side effects.
    #[error("canceled by user")]
    Canceled { code: i64 },

    /// The backend answered with a non-success envelope and the caller
    /// opted out of catching.
    #[error("api failure {code}: {desc}")]
    Api { code: i64, desc: String, data: Value },

    /// No envelope came back; synthesized from the raw HTTP outcome.
    #[error("http failure {code}: {desc}")]
    Http { code: i64, desc: String },

    /// A before-request middleware halted the call.
    #[error("rejected by request middleware")]
    Rejected,

    #[error("client build failed: {0}")]
    Build(String),
}

impl HttpError {
    pub fn code(&self) -> i64 {
        match self {
            HttpError::Canceled { code } => *code,
            HttpError::Api { code, .. } => *code,
            HttpError::Http { code, .. } => *code,
            HttpError::Rejected | HttpError::Build(_) => 0,
        }
    }
}
