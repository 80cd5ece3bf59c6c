//! Topic construction and parsing for the business-event broker namespace.
//!
//! Every client owns the subtree `iot/v1/c/{client_id}`; subjects are the
//! path below that root. Will messages go out on the callback namespace
//! `iot/v1/cb/{client_id}`.

/// Sentinel client id used before a session exists. Every network-touching
/// operation short-circuits while the client id is the guest sentinel.
pub const GUEST_CLIENT_ID: &str = "guest";

/// Root of the per-client subscription namespace.
const CLIENT_ROOT: &str = "iot/v1/c";

/// Root of the per-client callback namespace (will messages).
const CALLBACK_ROOT: &str = "iot/v1/cb";

/// Topic construction and subject extraction for one client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    client_id: String,
}

impl TopicScheme {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// Scheme for the unauthenticated sentinel state.
    pub fn guest() -> Self {
        Self::new(GUEST_CLIENT_ID)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_guest(&self) -> bool {
        self.client_id == GUEST_CLIENT_ID
    }

    /// Full broker topic for a subject: `iot/v1/c/{client_id}/{subject}`.
    pub fn client_topic(&self, subject: &str) -> String {
        format!("{CLIENT_ROOT}/{}/{subject}", self.client_id)
    }

    /// Wildcard covering every subject of this client.
    pub fn wildcard(&self) -> String {
        format!("{CLIENT_ROOT}/{}/#", self.client_id)
    }

    /// Will-message topic: `iot/v1/cb/{client_id}/user/disconnect`.
    pub fn will_topic(&self) -> String {
        format!("{CALLBACK_ROOT}/{}/user/disconnect", self.client_id)
    }

    /// Recover the subject portion of a topic published into this client's
    /// namespace, or `None` when the topic belongs to someone else.
    pub fn subject_of(&self, topic: &str) -> Option<String> {
        let prefix = format!("{CLIENT_ROOT}/{}/", self.client_id);
        let rest = topic.strip_prefix(&prefix)?;
        if rest.is_empty() {
            return None;
        }
        Some(rest.to_string())
    }
}

/// Topic carried in interest-notification bodies. The backend resolves the
/// `uuid` segment to the caller's client id on its side.
pub fn notify_topic(subject: &str) -> String {
    format!("{CLIENT_ROOT}/uuid/{subject}")
}
