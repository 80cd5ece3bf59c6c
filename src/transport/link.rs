//! Broker link seam.
//!
//! Transports and the shared host drive an [`MqttLink`] obtained from a
//! [`LinkConnector`] instead of touching rumqttc directly, so broker
//! behavior is injectable in tests. The rumqttc implementation runs a
//! supervisor task that polls the event loop, forwards packets as
//! [`LinkEvent`]s, and sleeps the fixed reconnect period after a
//! connection error before polling resumes the connection.

use crate::protocol::{ConnAck, ConnectOptions, PacketMeta};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, SubscribeFilter};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use url::Url;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid broker url: {0}")]
    InvalidBrokerUrl(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("client request failed: {0}")]
    Request(String),
}

/// Raw broker-side happenings, before transport semantics are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConnAck(ConnAck),
    Message {
        topic: String,
        payload: Vec<u8>,
        packet: PacketMeta,
    },
    SubAck {
        granted: Vec<u8>,
    },
    /// The broker sent a DISCONNECT frame before dropping us.
    Disconnected,
    Closed {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
    },
    PacketSend,
    PacketReceive,
}

/// One live broker connection.
#[async_trait]
pub trait MqttLink: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), LinkError>;
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), LinkError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError>;
    async fn disconnect(&self) -> Result<(), LinkError>;
}

/// Establishes broker connections.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(
        &self,
        broker_url: &str,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MqttLink>, LinkError>;
}

/// Build rumqttc options from a broker URL and our connect options.
pub fn configure_mqtt_options(
    broker_url: &str,
    options: &ConnectOptions,
) -> Result<MqttOptions, LinkError> {
    let url =
        Url::parse(broker_url).map_err(|_| LinkError::InvalidBrokerUrl(broker_url.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| LinkError::InvalidBrokerUrl(broker_url.to_string()))?;

    let mut mqtt_options = match url.scheme() {
        "mqtt" => MqttOptions::new(&options.client_id, host, url.port().unwrap_or(1883)),
        "mqtts" => {
            let mut opts = MqttOptions::new(&options.client_id, host, url.port().unwrap_or(8883));
            opts.set_transport(rumqttc::Transport::tls_with_default_config());
            opts
        }
        // Websocket transports take the full URL as the broker address.
        "ws" => {
            let mut opts =
                MqttOptions::new(&options.client_id, broker_url, url.port().unwrap_or(80));
            opts.set_transport(rumqttc::Transport::Ws);
            opts
        }
        "wss" => {
            let mut opts =
                MqttOptions::new(&options.client_id, broker_url, url.port().unwrap_or(443));
            opts.set_transport(rumqttc::Transport::wss_with_default_config());
            opts
        }
        other => return Err(LinkError::InvalidBrokerUrl(format!("{other}://"))),
    };

    mqtt_options.set_credentials(&options.username, &options.password);
    mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive_secs));
    mqtt_options.set_clean_session(options.clean_session);
    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            QoS::AtLeastOnce,
            will.retain,
        ));
    }
    Ok(mqtt_options)
}

/// rumqttc-backed connector.
#[derive(Default)]
pub struct RumqttcConnector;

impl RumqttcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LinkConnector for RumqttcConnector {
    async fn connect(
        &self,
        broker_url: &str,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MqttLink>, LinkError> {
        let mqtt_options = configure_mqtt_options(broker_url, options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reconnect_period = Duration::from_millis(options.reconnect_period_ms);
        let client_id = options.client_id.clone();

        let supervisor: JoinHandle<()> = tokio::spawn(async move {
            info!(client_id = %client_id, "mqtt link supervisor started");
            let mut reconnect_attempts = 0u32;
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    polled = event_loop.poll() => {
                        match polled {
                            Ok(event) => {
                                let link_event = route_event(event);
                                if matches!(link_event, LinkEvent::ConnAck(_)) {
                                    reconnect_attempts = 0;
                                }
                                if events.send(link_event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(client_id = %client_id, error = %e, "mqtt link error");
                                let _ = events.send(LinkEvent::Closed { reason: e.to_string() });
                                reconnect_attempts += 1;
                                let _ = events.send(LinkEvent::Reconnecting {
                                    attempt: reconnect_attempts,
                                });
                                // Fixed reconnect period; polling again
                                // resumes the connection.
                                tokio::select! {
                                    changed = shutdown_rx.changed() => {
                                        if changed.is_err() || *shutdown_rx.borrow() {
                                            break;
                                        }
                                    }
                                    _ = tokio::time::sleep(reconnect_period) => {}
                                }
                            }
                        }
                    }
                }
            }
            debug!(client_id = %client_id, "mqtt link supervisor stopped");
        });

        Ok(Box::new(RumqttcLink {
            client,
            shutdown: shutdown_tx,
            supervisor,
        }))
    }
}

fn route_event(event: Event) -> LinkEvent {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => LinkEvent::ConnAck(ConnAck {
            session_present: ack.session_present,
            return_code: ack.code as u8,
        }),
        Event::Incoming(Packet::Publish(publish)) => LinkEvent::Message {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            packet: PacketMeta {
                dup: publish.dup,
                qos: publish.qos as u8,
                retain: publish.retain,
                pkid: publish.pkid,
            },
        },
        Event::Incoming(Packet::SubAck(suback)) => LinkEvent::SubAck {
            granted: suback
                .return_codes
                .iter()
                .map(|code| match code {
                    rumqttc::SubscribeReasonCode::Success(qos) => *qos as u8,
                    rumqttc::SubscribeReasonCode::Failure => 0x80,
                })
                .collect(),
        },
        Event::Incoming(Packet::Disconnect) => LinkEvent::Disconnected,
        Event::Incoming(_) => LinkEvent::PacketReceive,
        Event::Outgoing(_) => LinkEvent::PacketSend,
    }
}

struct RumqttcLink {
    client: AsyncClient,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

#[async_trait]
impl MqttLink for RumqttcLink {
    async fn subscribe(&self, topics: &[String]) -> Result<(), LinkError> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce))
            .collect();
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| LinkError::Request(e.to_string()))
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), LinkError> {
        for topic in topics {
            self.client
                .unsubscribe(topic)
                .await
                .map_err(|e| LinkError::Request(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| LinkError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let _ = self.shutdown.send(true);
        self.client
            .disconnect()
            .await
            .map_err(|e| LinkError::Request(e.to_string()))
    }
}

impl Drop for RumqttcLink {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.supervisor.abort();
    }
}
