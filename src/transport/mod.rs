//! Transport layer: the contract every MQTT-bearing channel satisfies, and
//! its two implementations (direct broker connection, shared-host port).
//!
//! Events fan out through a broadcast channel so any number of workers can
//! observe one transport without owning it.

use crate::protocol::{ConnAck, PacketMeta, TopicScheme};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod direct;
pub mod link;
pub mod shared;

pub use direct::DirectTransport;
pub use link::{LinkConnector, LinkError, LinkEvent, MqttLink, RumqttcConnector};
pub use shared::{SharedHost, SharedHostHandle, SharedTransport};

/// Fixed set of events a transport can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect(ConnAck),
    Reconnect,
    Close,
    /// The broker sent a DISCONNECT frame.
    Disconnect,
    Offline,
    Error(String),
    End,
    Message {
        topic: String,
        payload: Vec<u8>,
        packet: PacketMeta,
    },
    PacketSend,
    PacketReceive,
    SubscribeResolve {
        granted: Vec<u8>,
    },
    SubscribeReject {
        error: String,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no connection acknowledgement within {0} ms")]
    ConnectTimeout(u64),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("transport is not connected")]
    NotConnected,
    #[error("shared host is gone")]
    HostDetached,
}

/// Behavior flags a transport variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProfile {
    /// End the connection when the tab goes hidden, reconnect on visible.
    pub suspend_when_hidden: bool,
    /// Fetch the client id once and cache it for every tab.
    pub use_shared_client_id: bool,
}

impl TransportProfile {
    pub const DIRECT: Self = Self {
        suspend_when_hidden: true,
        use_shared_client_id: false,
    };

    pub const SHARED: Self = Self {
        suspend_when_hidden: false,
        use_shared_client_id: true,
    };
}

/// Shared contract of the direct and shared-host transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection; resolves on the broker's acknowledgement.
    async fn connect(&self) -> Result<ConnAck, TransportError>;

    /// Tear the channel down. `force` skips graceful niceties. A guest
    /// transport short-circuits.
    async fn end(&self, force: bool) -> Result<(), TransportError>;

    async fn reconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topics: Vec<String>) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    fn scheme(&self) -> TopicScheme;

    fn profile(&self) -> TransportProfile;

    fn is_connected(&self) -> bool;

    fn is_reconnecting(&self) -> bool;

    fn is_guest(&self) -> bool {
        self.scheme().is_guest()
    }
}

/// Subscription grants at or above 0x80 are failures.
pub(crate) fn grants_ok(granted: &[u8]) -> bool {
    granted.iter().all(|&code| code < 0x80)
}

/// Block until the transport's event stream yields a connection
/// acknowledgement, an error, or the timeout elapses.
pub(crate) async fn wait_for_connack(
    mut rx: broadcast::Receiver<TransportEvent>,
    timeout_ms: u64,
) -> Result<ConnAck, TransportError> {
    let deadline = std::time::Duration::from_millis(timeout_ms);
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(TransportEvent::Connect(ack)) => return Ok(ack),
                Ok(TransportEvent::Error(error)) => {
                    return Err(TransportError::Link(LinkError::ConnectionFailed(error)))
                }
                Ok(_) => continue,
                Err(_) => return Err(TransportError::NotConnected),
            }
        }
    })
    .await
    .map_err(|_| TransportError::ConnectTimeout(timeout_ms))?
}
