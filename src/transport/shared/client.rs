//! Tab-side shared transport.
//!
//! Satisfies the same contract as the direct variant, but every operation
//! is a `WorkerAction` posted to the shared host, and all state changes
//! arrive as `WorkerFeedback` over this tab's port. Local shadow flags
//! mirror the host's connection state.

use super::host::{PortId, SharedHostHandle};
use crate::protocol::{ConnAck, ConnectOptions, TopicScheme, WorkerAction, WorkerFeedback};
use crate::transport::{Transport, TransportError, TransportEvent, TransportProfile};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Flags {
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

pub struct SharedTransport {
    host: SharedHostHandle,
    port: PortId,
    broker_url: String,
    options: ConnectOptions,
    scheme: TopicScheme,
    events_tx: broadcast::Sender<TransportEvent>,
    flags: Arc<Flags>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    detached: AtomicBool,
}

impl SharedTransport {
    /// Open a port on the shared host and start translating its feedback.
    pub async fn attach(
        host: SharedHostHandle,
        broker_url: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self, TransportError> {
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let port = host.attach(feedback_tx).await?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let flags = Arc::new(Flags::default());
        let scheme = TopicScheme::new(options.client_id.clone());

        let transport = Self {
            host,
            port,
            broker_url: broker_url.into(),
            options,
            scheme,
            events_tx: events_tx.clone(),
            flags: flags.clone(),
            pump: parking_lot::Mutex::new(None),
            detached: AtomicBool::new(false),
        };
        transport.spawn_pump(feedback_rx);
        Ok(transport)
    }

    fn spawn_pump(&self, mut feedback_rx: mpsc::UnboundedReceiver<WorkerFeedback>) {
        let events_tx = self.events_tx.clone();
        let flags = self.flags.clone();
        let handle = tokio::spawn(async move {
            while let Some(feedback) = feedback_rx.recv().await {
                let event = match feedback {
                    WorkerFeedback::MqttConnect { connack } => {
                        flags.connected.store(true, Ordering::SeqCst);
                        flags.reconnecting.store(false, Ordering::SeqCst);
                        TransportEvent::Connect(connack)
                    }
                    WorkerFeedback::MqttReconnect => {
                        flags.reconnecting.store(true, Ordering::SeqCst);
                        TransportEvent::Reconnect
                    }
                    WorkerFeedback::MqttClose => {
                        flags.connected.store(false, Ordering::SeqCst);
                        TransportEvent::Close
                    }
                    WorkerFeedback::MqttDisconnect { packet: _ } => TransportEvent::Disconnect,
                    WorkerFeedback::MqttOffline => {
                        flags.connected.store(false, Ordering::SeqCst);
                        TransportEvent::Offline
                    }
                    WorkerFeedback::MqttError { error } => TransportEvent::Error(error),
                    WorkerFeedback::MqttEnd => {
                        // Session-over for the whole origin.
                        flags.connected.store(false, Ordering::SeqCst);
                        flags.reconnecting.store(false, Ordering::SeqCst);
                        TransportEvent::End
                    }
                    WorkerFeedback::MqttMessage {
                        topic,
                        payload,
                        packet,
                    } => TransportEvent::Message {
                        topic,
                        payload,
                        packet,
                    },
                    WorkerFeedback::MqttSubscribeResolve { granted } => {
                        TransportEvent::SubscribeResolve { granted }
                    }
                    WorkerFeedback::MqttSubscribeReject { error } => {
                        TransportEvent::SubscribeReject { error }
                    }
                };
                let _ = events_tx.send(event);
            }
        });
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Post the unload notice and close this tab's port. The shared client
    /// keeps running for other tabs.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.host.post(self.port, WorkerAction::BeforeBrowserTabUnload);
    }
}

#[async_trait]
impl Transport for SharedTransport {
    async fn connect(&self) -> Result<ConnAck, TransportError> {
        let rx = self.events_tx.subscribe();
        self.host.post(
            self.port,
            WorkerAction::MqttConnect {
                broker_url: self.broker_url.clone(),
                opts: self.options.clone(),
            },
        )?;
        crate::transport::wait_for_connack(rx, self.options.connect_timeout_ms).await
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        if self.is_guest() {
            return Ok(());
        }
        if force {
            // Tear down the real client for every tab of the origin.
            let _ = self.host.post(self.port, WorkerAction::MqttEnd { force });
        }
        self.detach();
        self.flags.connected.store(false, Ordering::SeqCst);
        self.flags.reconnecting.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::End);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.host.post(self.port, WorkerAction::MqttReconnect)
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), TransportError> {
        self.host
            .post(self.port, WorkerAction::MqttSubscribe { topics })
    }

    async fn unsubscribe(&self, topics: Vec<String>) -> Result<(), TransportError> {
        self.host
            .post(self.port, WorkerAction::MqttUnsubscribe { topics })
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.host.post(
            self.port,
            WorkerAction::MqttPublish {
                topic,
                payload,
                retain,
            },
        )
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn scheme(&self) -> TopicScheme {
        self.scheme.clone()
    }

    fn profile(&self) -> TransportProfile {
        TransportProfile::SHARED
    }

    fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
    }

    fn is_reconnecting(&self) -> bool {
        self.flags.reconnecting.load(Ordering::SeqCst)
    }
}

impl Drop for SharedTransport {
    fn drop(&mut self) {
        self.detach();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
