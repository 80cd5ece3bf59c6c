//! Protocol-level types: topic scheme, domain identities, and the message
//! schema shared between tab transports and the shared host.

pub mod messages;
pub mod topics;

pub use messages::{
    Business, ClientKind, ConnAck, ConnectOptions, DisconnectPacket, LastWillConfig, NotifyBody,
    PacketMeta, WillMessage, WillPayload, WorkerAction, WorkerFeedback,
};
pub use topics::{notify_topic, TopicScheme, GUEST_CLIENT_ID};
