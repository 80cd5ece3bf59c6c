//! Shared-host transport variant: one real MQTT client for every tab of
//! the origin, reached over a message-port protocol.

pub mod client;
pub mod host;

pub use client::SharedTransport;
pub use host::{PortId, SharedHost, SharedHostHandle};
