//! Wire and domain message types.
//!
//! Covers the business (follow) identity, the broker will message, the
//! interest-notification HTTP bodies, and the message protocol spoken
//! between tab-side transports and the shared host. Every shared-host
//! message serializes as `{"type": ..., "args": ...}`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A `(subject, bid)` pair a component wants server-pushed updates for.
///
/// `bid = None` denotes a subject the client wants to receive but does not
/// need the server to explicitly route; no interest-notification call is
/// made for such follows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Business {
    pub subject: String,
    pub bid: Option<String>,
}

impl Business {
    pub fn new(subject: impl Into<String>, bid: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            bid: Some(bid.into()),
        }
    }

    /// A follow with no server-side routing selector.
    pub fn unrouted(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            bid: None,
        }
    }

    /// Stable identity: `"{subject}|{bid or empty}"`. Two businesses with
    /// equal identity are interchangeable.
    pub fn identity(&self) -> String {
        format!("{}|{}", self.subject, self.bid.as_deref().unwrap_or(""))
    }
}

/// Body of the `notify/sub` and `notify/unsub` interest calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyBody {
    pub bid: String,
    pub topic: String,
    pub client_id: String,
}

/// Page class reported when fetching a client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientKind {
    #[default]
    #[serde(rename = "base-page")]
    BasePage,
    #[serde(rename = "sub-page")]
    SubPage,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::BasePage => "base-page",
            ClientKind::SubPage => "sub-page",
        }
    }
}

/// Will message published by the broker on ungraceful disconnect, on
/// `iot/v1/cb/{client_id}/user/disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WillMessage {
    pub service: String,
    pub method: String,
    pub seq: u32,
    pub src_addr: String,
    pub client_id: String,
    pub payload: WillPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WillPayload {
    pub timestamp: i64,
    pub unique_msg_id: u32,
    pub token: String,
}

impl WillMessage {
    /// Compose the user-disconnect will for a client. Carries the third
    /// segment of the session JWT and a millisecond timestamp.
    pub fn disconnect(client_id: &str, token: &str, seq: u32) -> Self {
        let signature = token.split('.').nth(2).unwrap_or_default().to_string();
        Self {
            service: "user".to_string(),
            method: "disconnect".to_string(),
            seq,
            src_addr: format!("0.{client_id}"),
            client_id: client_id.to_string(),
            payload: WillPayload {
                timestamp: Utc::now().timestamp_millis(),
                unique_msg_id: 0,
                token: signature,
            },
        }
    }
}

/// Delivery metadata of the PUBLISH frame a message arrived in. Travels
/// with every relayed message so digests see what the broker sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketMeta {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub pkid: u16,
}

/// DISCONNECT frame relayed to tabs. Protocol level 4 carries no reason
/// code on the wire; zero stands for a normal disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPacket {
    pub reason_code: u8,
}

/// Connection acknowledgement relayed to transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAck {
    pub fn success() -> Self {
        Self {
            session_present: false,
            return_code: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// Broker connection parameters composed by the service at `init` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_will: Option<LastWillConfig>,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    6_000
}

fn default_reconnect_period_ms() -> u64 {
    5_000
}

impl ConnectOptions {
    pub fn new(
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: default_clean_session(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_period_ms: default_reconnect_period_ms(),
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, will: LastWillConfig) -> Self {
        self.last_will = Some(will);
        self
    }
}

/// Will-message configuration, QoS 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

/// Messages a tab-side transport posts to the shared host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args")]
pub enum WorkerAction {
    MqttConnect {
        broker_url: String,
        opts: ConnectOptions,
    },
    MqttEnd {
        force: bool,
    },
    MqttPublish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    MqttReconnect,
    MqttSubscribe {
        topics: Vec<String>,
    },
    MqttUnsubscribe {
        topics: Vec<String>,
    },
    BeforeBrowserTabUnload,
}

/// Feedback the shared host posts back to tab ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args")]
pub enum WorkerFeedback {
    MqttConnect {
        connack: ConnAck,
    },
    MqttReconnect,
    MqttClose,
    MqttDisconnect {
        packet: DisconnectPacket,
    },
    MqttOffline,
    MqttError {
        error: String,
    },
    MqttEnd,
    MqttMessage {
        topic: String,
        payload: Vec<u8>,
        packet: PacketMeta,
    },
    MqttSubscribeResolve {
        granted: Vec<u8>,
    },
    MqttSubscribeReject {
        error: String,
    },
}
