//! Shared-host actor.
//!
//! Owns the one real MQTT link for every attached tab. Tabs reach it only
//! through `WorkerAction` messages posted over their port; everything the
//! broker does comes back as `WorkerFeedback`, broadcast to every live
//! port (or unicast where the protocol says so).

use crate::protocol::{ConnAck, ConnectOptions, DisconnectPacket, WorkerAction, WorkerFeedback};
use crate::transport::link::{LinkConnector, LinkError, LinkEvent, MqttLink};
use crate::transport::{grants_ok, TransportError};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type PortId = u64;

pub(crate) enum HostCommand {
    Attach {
        feedback: mpsc::UnboundedSender<WorkerFeedback>,
        reply: oneshot::Sender<PortId>,
    },
    Action {
        port: PortId,
        action: WorkerAction,
    },
}

/// Address of a running shared host. Cloned into every tab of the origin.
#[derive(Clone)]
pub struct SharedHostHandle {
    cmd_tx: mpsc::UnboundedSender<HostCommand>,
}

impl SharedHostHandle {
    pub(crate) async fn attach(
        &self,
        feedback: mpsc::UnboundedSender<WorkerFeedback>,
    ) -> Result<PortId, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::Attach { feedback, reply })
            .map_err(|_| TransportError::HostDetached)?;
        rx.await.map_err(|_| TransportError::HostDetached)
    }

    pub(crate) fn post(&self, port: PortId, action: WorkerAction) -> Result<(), TransportError> {
        self.cmd_tx
            .send(HostCommand::Action { port, action })
            .map_err(|_| TransportError::HostDetached)
    }
}

pub struct SharedHost;

impl SharedHost {
    /// Start the actor and hand back its address.
    pub fn spawn(connector: Arc<dyn LinkConnector>) -> SharedHostHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_host(connector, cmd_rx));
        SharedHostHandle { cmd_tx }
    }
}

struct Port {
    id: PortId,
    feedback: mpsc::UnboundedSender<WorkerFeedback>,
}

struct HostState {
    ports: Vec<Port>,
    subscribed: HashSet<String>,
    /// Batches awaiting their suback, in request order.
    pending_subscribes: VecDeque<Vec<String>>,
    is_setting_up: bool,
    is_settled: bool,
    link: Option<Box<dyn MqttLink>>,
    next_port: PortId,
}

impl HostState {
    fn new() -> Self {
        Self {
            ports: Vec::new(),
            subscribed: HashSet::new(),
            pending_subscribes: VecDeque::new(),
            is_setting_up: false,
            is_settled: false,
            link: None,
            next_port: 1,
        }
    }

    fn broadcast(&mut self, feedback: WorkerFeedback) {
        self.ports
            .retain(|port| port.feedback.send(feedback.clone()).is_ok());
    }

    fn unicast(&self, port: PortId, feedback: WorkerFeedback) {
        if let Some(target) = self.ports.iter().find(|p| p.id == port) {
            let _ = target.feedback.send(feedback);
        }
    }
}

async fn run_host(connector: Arc<dyn LinkConnector>, mut cmd_rx: mpsc::UnboundedReceiver<HostCommand>) {
    let mut state = HostState::new();
    let (link_events_tx, mut link_events_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let (setup_tx, mut setup_rx) =
        mpsc::unbounded_channel::<Result<Box<dyn MqttLink>, LinkError>>();

    info!("shared host started");
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => break,
                Some(HostCommand::Attach { feedback, reply }) => {
                    let id = state.next_port;
                    state.next_port += 1;
                    state.ports.push(Port { id, feedback });
                    let _ = reply.send(id);
                    debug!(port = id, "tab port attached");
                }
                Some(HostCommand::Action { port, action }) => {
                    handle_action(
                        &mut state,
                        &connector,
                        &link_events_tx,
                        &setup_tx,
                        port,
                        action,
                    )
                    .await;
                }
            },
            Some(result) = setup_rx.recv() => match result {
                Ok(link) => {
                    state.link = Some(link);
                    state.is_settled = true;
                    state.is_setting_up = false;
                    info!("shared mqtt client settled");
                }
                Err(e) => {
                    state.is_setting_up = false;
                    warn!(error = %e, "shared mqtt client setup failed");
                    state.broadcast(WorkerFeedback::MqttError {
                        error: e.to_string(),
                    });
                }
            },
            Some(event) = link_events_rx.recv() => {
                handle_link_event(&mut state, event);
            }
        }
    }
    info!("shared host stopped");
}

async fn handle_action(
    state: &mut HostState,
    connector: &Arc<dyn LinkConnector>,
    link_events_tx: &mpsc::UnboundedSender<LinkEvent>,
    setup_tx: &mpsc::UnboundedSender<Result<Box<dyn MqttLink>, LinkError>>,
    port: PortId,
    action: WorkerAction,
) {
    match action {
        WorkerAction::MqttConnect { broker_url, opts } => {
            if state.is_setting_up {
                // Another port is already building the client; the connack
                // will broadcast to everyone.
                return;
            }
            if state.is_settled {
                state.unicast(
                    port,
                    WorkerFeedback::MqttConnect {
                        connack: ConnAck::success(),
                    },
                );
                return;
            }
            state.is_setting_up = true;
            spawn_setup(connector.clone(), broker_url, opts, link_events_tx.clone(), setup_tx.clone());
        }
        WorkerAction::MqttEnd { force: _ } => {
            if let Some(link) = state.link.take() {
                let _ = link.disconnect().await;
            }
            end_session(state);
        }
        WorkerAction::MqttPublish {
            topic,
            payload,
            retain,
        } => {
            let failure = match state.link.as_ref() {
                Some(link) => link.publish(&topic, payload, retain).await.err(),
                None => None,
            };
            if let Some(e) = failure {
                state.broadcast(WorkerFeedback::MqttError {
                    error: e.to_string(),
                });
            }
        }
        WorkerAction::MqttReconnect => {
            // The link supervisor reconnects on its own; nothing to drive.
        }
        WorkerAction::MqttSubscribe { topics } => {
            let fresh: Vec<String> = topics
                .into_iter()
                .filter(|t| !state.subscribed.contains(t))
                .collect();
            if fresh.is_empty() {
                // Everything already subscribed; resolve the caller alone.
                state.unicast(port, WorkerFeedback::MqttSubscribeResolve { granted: vec![] });
                return;
            }
            let outcome = match state.link.as_ref() {
                Some(link) => link.subscribe(&fresh).await.map_err(|e| e.to_string()),
                None => Err("no mqtt client".to_string()),
            };
            match outcome {
                Ok(()) => state.pending_subscribes.push_back(fresh),
                Err(error) => {
                    state.unicast(port, WorkerFeedback::MqttSubscribeReject { error })
                }
            }
        }
        WorkerAction::MqttUnsubscribe { topics } => {
            let known: Vec<String> = topics
                .into_iter()
                .filter(|t| state.subscribed.remove(t))
                .collect();
            if known.is_empty() {
                return;
            }
            if let Some(link) = state.link.as_ref() {
                if let Err(e) = link.unsubscribe(&known).await {
                    warn!(error = %e, "unsubscribe failed");
                }
            }
        }
        WorkerAction::BeforeBrowserTabUnload => {
            state.ports.retain(|p| p.id != port);
            debug!(port, "tab port closed");
        }
    }
}

fn spawn_setup(
    connector: Arc<dyn LinkConnector>,
    broker_url: String,
    opts: ConnectOptions,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    setup_tx: mpsc::UnboundedSender<Result<Box<dyn MqttLink>, LinkError>>,
) {
    tokio::spawn(async move {
        let result = connector.connect(&broker_url, &opts, link_events_tx).await;
        let _ = setup_tx.send(result);
    });
}

/// Session is over: tell every surviving tab, drop the ports, reset.
fn end_session(state: &mut HostState) {
    state.broadcast(WorkerFeedback::MqttEnd);
    state.ports.clear();
    state.subscribed.clear();
    state.pending_subscribes.clear();
    state.is_setting_up = false;
    state.is_settled = false;
}

fn handle_link_event(state: &mut HostState, event: LinkEvent) {
    match event {
        LinkEvent::ConnAck(connack) => {
            state.broadcast(WorkerFeedback::MqttConnect { connack });
        }
        LinkEvent::Message {
            topic,
            payload,
            packet,
        } => {
            state.broadcast(WorkerFeedback::MqttMessage {
                topic,
                payload,
                packet,
            });
        }
        LinkEvent::Disconnected => {
            state.broadcast(WorkerFeedback::MqttDisconnect {
                packet: DisconnectPacket::default(),
            });
        }
        LinkEvent::SubAck { granted } => {
            if grants_ok(&granted) {
                if let Some(batch) = state.pending_subscribes.pop_front() {
                    state.subscribed.extend(batch);
                }
                state.broadcast(WorkerFeedback::MqttSubscribeResolve { granted });
            } else {
                state.pending_subscribes.pop_front();
                state.broadcast(WorkerFeedback::MqttSubscribeReject {
                    error: format!("broker rejected subscription: {granted:?}"),
                });
            }
        }
        LinkEvent::Closed { .. } => {
            state.broadcast(WorkerFeedback::MqttClose);
            state.broadcast(WorkerFeedback::MqttOffline);
        }
        LinkEvent::Reconnecting { .. } => {
            state.broadcast(WorkerFeedback::MqttReconnect);
        }
        LinkEvent::PacketSend | LinkEvent::PacketReceive => {}
    }
}
