//! Mock implementations for testing.
//!
//! `MockConnector`/`MockLink` stand in for the broker behind the link seam;
//! `MockTransport` satisfies the full transport contract for worker and
//! service tests. All of them record what was asked of them.

use crate::protocol::{ConnAck, ConnectOptions, PacketMeta, TopicScheme};
use crate::transport::link::{LinkConnector, LinkError, LinkEvent, MqttLink};
use crate::transport::{Transport, TransportError, TransportEvent, TransportProfile};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// What a mock link was asked to do.
#[derive(Debug, Clone, Default)]
pub struct LinkCalls {
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub publishes: usize,
    pub disconnects: usize,
    pub subscribed_topics: Vec<Vec<String>>,
    pub unsubscribed_topics: Vec<Vec<String>>,
    pub published: Vec<(String, Vec<u8>, bool)>,
}

#[derive(Clone, Copy)]
enum ConnectBehavior {
    Ack,
    Silent,
    Refuse(u8),
}

/// Broker stand-in handed to transports and the shared host.
pub struct MockConnector {
    behavior: ConnectBehavior,
    connects: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    calls: Arc<Mutex<LinkCalls>>,
}

impl MockConnector {
    /// Acknowledges connections and subscriptions.
    pub fn new() -> Self {
        Self::with_behavior(ConnectBehavior::Ack)
    }

    /// Never acknowledges; connects appear to hang.
    pub fn silent() -> Self {
        Self::with_behavior(ConnectBehavior::Silent)
    }

    /// Refuses the connection with the given return code.
    pub fn refusing(code: u8) -> Self {
        Self::with_behavior(ConnectBehavior::Refuse(code))
    }

    fn with_behavior(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            connects: AtomicUsize::new(0),
            events: Mutex::new(None),
            calls: Arc::new(Mutex::new(LinkCalls::default())),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn link_calls(&self) -> LinkCalls {
        self.calls.lock().clone()
    }

    /// Push a broker-side event into the most recent link.
    pub fn emit(&self, event: LinkEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkConnector for MockConnector {
    async fn connect(
        &self,
        _broker_url: &str,
        _options: &ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MqttLink>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.events.lock() = Some(events.clone());
        match self.behavior {
            ConnectBehavior::Ack => {
                let _ = events.send(LinkEvent::ConnAck(ConnAck::success()));
            }
            ConnectBehavior::Refuse(code) => {
                let _ = events.send(LinkEvent::ConnAck(ConnAck {
                    session_present: false,
                    return_code: code,
                }));
            }
            ConnectBehavior::Silent => {}
        }
        Ok(Box::new(MockLink {
            events,
            calls: self.calls.clone(),
            auto_ack: matches!(self.behavior, ConnectBehavior::Ack),
        }))
    }
}

struct MockLink {
    events: mpsc::UnboundedSender<LinkEvent>,
    calls: Arc<Mutex<LinkCalls>>,
    auto_ack: bool,
}

#[async_trait]
impl MqttLink for MockLink {
    async fn subscribe(&self, topics: &[String]) -> Result<(), LinkError> {
        {
            let mut calls = self.calls.lock();
            calls.subscribes += 1;
            calls.subscribed_topics.push(topics.to_vec());
        }
        if self.auto_ack {
            let _ = self.events.send(LinkEvent::SubAck {
                granted: vec![1; topics.len()],
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), LinkError> {
        let mut calls = self.calls.lock();
        calls.unsubscribes += 1;
        calls.unsubscribed_topics.push(topics.to_vec());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError> {
        let mut calls = self.calls.lock();
        calls.publishes += 1;
        calls.published.push((topic.to_string(), payload, retain));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.calls.lock().disconnects += 1;
        Ok(())
    }
}

/// Full transport stand-in for worker and service tests.
pub struct MockTransport {
    scheme: TopicScheme,
    profile: TransportProfile,
    events_tx: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    pub connects: AtomicUsize,
    pub ends: AtomicUsize,
    pub forced_ends: AtomicUsize,
    subscriptions: Mutex<Vec<Vec<String>>>,
    unsubscriptions: Mutex<Vec<Vec<String>>>,
    published: Mutex<Vec<(String, Vec<u8>, bool)>>,
}

impl MockTransport {
    pub fn new(client_id: &str) -> Self {
        Self::with_profile(client_id, TransportProfile::DIRECT)
    }

    pub fn with_profile(client_id: &str, profile: TransportProfile) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            scheme: TopicScheme::new(client_id),
            profile,
            events_tx,
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
            forced_ends: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Deliver a broker message as the transport would, at QoS 1.
    pub fn emit_message(&self, topic: &str, payload: &[u8]) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            packet: PacketMeta {
                qos: 1,
                ..Default::default()
            },
        });
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<Vec<String>> {
        self.unsubscriptions.lock().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<ConnAck, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        let ack = ConnAck::success();
        let _ = self.events_tx.send(TransportEvent::Connect(ack));
        Ok(ack)
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        if self.is_guest() {
            return Ok(());
        }
        self.ends.fetch_add(1, Ordering::SeqCst);
        if force {
            self.forced_ends.fetch_add(1, Ordering::SeqCst);
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::End);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let _ = self.events_tx.send(TransportEvent::Reconnect);
        self.connect().await.map(|_| ())
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), TransportError> {
        self.subscriptions.lock().push(topics);
        Ok(())
    }

    async fn unsubscribe(&self, topics: Vec<String>) -> Result<(), TransportError> {
        self.unsubscriptions.lock().push(topics);
        Ok(())
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.published.lock().push((topic, payload, retain));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn scheme(&self) -> TopicScheme {
        self.scheme.clone()
    }

    fn profile(&self) -> TransportProfile {
        self.profile
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_reconnecting(&self) -> bool {
        false
    }
}
