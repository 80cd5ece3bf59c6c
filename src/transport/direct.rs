//! Direct transport: one broker link owned by this process.

use super::link::{LinkConnector, LinkEvent, MqttLink};
use super::{grants_ok, Transport, TransportError, TransportEvent, TransportProfile};
use crate::protocol::{ConnAck, ConnectOptions, TopicScheme};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Flags {
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

pub struct DirectTransport {
    connector: Arc<dyn LinkConnector>,
    broker_url: String,
    options: ConnectOptions,
    scheme: TopicScheme,
    events_tx: broadcast::Sender<TransportEvent>,
    flags: Arc<Flags>,
    link: Arc<Mutex<Option<Box<dyn MqttLink>>>>,
    subscribed: Arc<parking_lot::Mutex<Vec<String>>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        broker_url: impl Into<String>,
        options: ConnectOptions,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheme = TopicScheme::new(options.client_id.clone());
        Self {
            connector,
            broker_url: broker_url.into(),
            options,
            scheme,
            events_tx,
            flags: Arc::new(Flags::default()),
            link: Arc::new(Mutex::new(None)),
            subscribed: Arc::new(parking_lot::Mutex::new(Vec::new())),
            pump: parking_lot::Mutex::new(None),
        }
    }

    fn spawn_pump(&self, mut link_rx: mpsc::UnboundedReceiver<LinkEvent>) {
        let events_tx = self.events_tx.clone();
        let flags = self.flags.clone();
        let link = self.link.clone();
        let subscribed = self.subscribed.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                match event {
                    LinkEvent::ConnAck(ack) if ack.is_success() => {
                        flags.connected.store(true, Ordering::SeqCst);
                        flags.reconnecting.store(false, Ordering::SeqCst);
                        // Restore subscriptions after a reconnect.
                        let topics = subscribed.lock().clone();
                        if !topics.is_empty() {
                            if let Some(link) = link.lock().await.as_ref() {
                                if let Err(e) = link.subscribe(&topics).await {
                                    warn!(error = %e, "resubscription failed");
                                }
                            }
                        }
                        let _ = events_tx.send(TransportEvent::Connect(ack));
                    }
                    LinkEvent::ConnAck(ack) => {
                        // The broker refused us: dispatch the error, then
                        // end the client. The extra end pair is observable
                        // and intentional.
                        flags.connected.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(TransportEvent::Error(format!(
                            "connection refused: return code {}",
                            ack.return_code
                        )));
                        if let Some(link) = link.lock().await.take() {
                            let _ = link.disconnect().await;
                        }
                        let _ = events_tx.send(TransportEvent::End);
                        break;
                    }
                    LinkEvent::Message {
                        topic,
                        payload,
                        packet,
                    } => {
                        let _ = events_tx.send(TransportEvent::Message {
                            topic,
                            payload,
                            packet,
                        });
                    }
                    LinkEvent::Disconnected => {
                        flags.connected.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(TransportEvent::Disconnect);
                    }
                    LinkEvent::SubAck { granted } => {
                        let event = if grants_ok(&granted) {
                            TransportEvent::SubscribeResolve { granted }
                        } else {
                            TransportEvent::SubscribeReject {
                                error: format!("broker rejected subscription: {granted:?}"),
                            }
                        };
                        let _ = events_tx.send(event);
                    }
                    LinkEvent::Closed { .. } => {
                        flags.connected.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(TransportEvent::Close);
                        let _ = events_tx.send(TransportEvent::Offline);
                    }
                    LinkEvent::Reconnecting { .. } => {
                        flags.reconnecting.store(true, Ordering::SeqCst);
                        let _ = events_tx.send(TransportEvent::Reconnect);
                    }
                    LinkEvent::PacketSend => {
                        let _ = events_tx.send(TransportEvent::PacketSend);
                    }
                    LinkEvent::PacketReceive => {
                        let _ = events_tx.send(TransportEvent::PacketReceive);
                    }
                }
            }
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

}

#[async_trait]
impl Transport for DirectTransport {
    async fn connect(&self) -> Result<ConnAck, TransportError> {
        let rx = self.events_tx.subscribe();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let link = self
            .connector
            .connect(&self.broker_url, &self.options, link_tx)
            .await?;
        *self.link.lock().await = Some(link);
        self.spawn_pump(link_rx);
        super::wait_for_connack(rx, self.options.connect_timeout_ms).await
    }

    async fn end(&self, _force: bool) -> Result<(), TransportError> {
        // The guest sentinel never reached the broker.
        if self.is_guest() {
            return Ok(());
        }
        self.flags.connected.store(false, Ordering::SeqCst);
        self.flags.reconnecting.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.disconnect().await;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let _ = self.events_tx.send(TransportEvent::End);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.disconnect().await;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.connect().await.map(|_| ())
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), TransportError> {
        {
            let mut subscribed = self.subscribed.lock();
            for topic in &topics {
                if !subscribed.contains(topic) {
                    subscribed.push(topic.clone());
                }
            }
        }
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        link.subscribe(&topics).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topics: Vec<String>) -> Result<(), TransportError> {
        self.subscribed.lock().retain(|t| !topics.contains(t));
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        link.unsubscribe(&topics).await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        link.publish(&topic, payload, retain).await?;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn scheme(&self) -> TopicScheme {
        self.scheme.clone()
    }

    fn profile(&self) -> TransportProfile {
        TransportProfile::DIRECT
    }

    fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
    }

    fn is_reconnecting(&self) -> bool {
        self.flags.reconnecting.load(Ordering::SeqCst)
    }
}
