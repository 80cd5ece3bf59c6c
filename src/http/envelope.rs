//! API response envelope.
//!
//! Every backend endpoint answers `{code, data, desc}`. Whether a raw body
//! is an envelope is decided by a discriminated decode: parse strictly, and
//! fall through to the raw-HTTP classification on structural mismatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend code signalling a revoked session.
pub const FORBIDDEN_CODE: i64 = 600_057;

const SUCCESS_CODE: i64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub code: i64,
    #[serde(default)]
    pub data: Value,
    pub desc: String,
}

impl ApiEnvelope {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == FORBIDDEN_CODE
    }

    /// Envelope synthesized from a plain HTTP outcome (no envelope body).
    pub fn synthesized(code: i64, desc: impl Into<String>) -> Self {
        Self {
            code,
            data: Value::Object(serde_json::Map::new()),
            desc: desc.into(),
        }
    }

    /// Strict decode: `code` must be a number and `desc` a string.
    pub fn decode(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}
