//! Service: one instance per tab.
//!
//! Owns the shared transport, assembles credentials from the cache, mints
//! workers, and walks the lifecycle state machine. Transitions are
//! monotone; an illegal transition is a logged no-op, which is what makes
//! `quit`/`force_quit` safe against the browser firing unload and
//! visibility events in rapid succession.

use crate::cache::{keys, Cache};
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::http::{HttpClient, RequestOptions};
use crate::interest::InterestRegistry;
use crate::protocol::{
    ConnectOptions, LastWillConfig, TopicScheme, WillMessage, GUEST_CLIENT_ID,
};
use crate::transport::link::LinkConnector;
use crate::transport::{
    DirectTransport, SharedHostHandle, SharedTransport, Transport, TransportEvent,
    TransportProfile,
};
use crate::worker::Worker;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLIENT_ID_ENDPOINT: &str = "/v2/client/getClientId";

/// Lifecycle states. Transitions only ever move forward along the arrows
/// of `can_advance`; everything else is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Initializing,
    Running,
    Suspending,
    Suspended,
    Resuming,
    Stopping,
}

impl ServiceState {
    pub fn can_advance(self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, to),
            (Created, Initializing)
                | (Initializing, Running)
                | (Initializing, Created)
                | (Running, Suspending)
                | (Running, Stopping)
                | (Suspending, Suspended)
                | (Suspended, Resuming)
                | (Resuming, Running)
                | (Stopping, Created)
        )
    }
}

/// Which transport variant backs this tab.
#[derive(Clone)]
pub enum TransportMode {
    Direct,
    Shared(SharedHostHandle),
}

impl TransportMode {
    pub fn profile(&self) -> TransportProfile {
        match self {
            TransportMode::Direct => TransportProfile::DIRECT,
            TransportMode::Shared(_) => TransportProfile::SHARED,
        }
    }
}

/// Injected browser integration: where are we, and how do we navigate.
#[derive(Clone)]
pub struct BrowserHooks {
    current_path: Arc<dyn Fn() -> String + Send + Sync>,
    navigate: Arc<dyn Fn(String) + Send + Sync>,
}

impl BrowserHooks {
    pub fn new(
        current_path: impl Fn() -> String + Send + Sync + 'static,
        navigate: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        Self {
            current_path: Arc::new(current_path),
            navigate: Arc::new(navigate),
        }
    }

    pub fn noop() -> Self {
        Self::new(|| "/".to_string(), |_| {})
    }
}

/// Where to send the user once the session is over, if anywhere.
fn login_redirect(login_path: &str, current: &str) -> Option<String> {
    if current.starts_with(login_path) {
        return None;
    }
    if current.is_empty() || current == "/" {
        Some(login_path.to_string())
    } else {
        Some(format!("{login_path}?from={current}"))
    }
}

pub struct Service {
    config: ServiceConfig,
    cache: Arc<dyn Cache>,
    http: HttpClient,
    registry: Arc<InterestRegistry>,
    connector: Arc<dyn LinkConnector>,
    mode: TransportMode,
    hooks: BrowserHooks,
    state: Mutex<ServiceState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    workers: Mutex<Vec<Arc<Worker>>>,
    internal_listener: Mutex<Option<JoinHandle<()>>>,
    will_seq: AtomicU32,
}

impl Service {
    pub fn new(
        config: ServiceConfig,
        cache: Arc<dyn Cache>,
        http: HttpClient,
        registry: Arc<InterestRegistry>,
        connector: Arc<dyn LinkConnector>,
        mode: TransportMode,
    ) -> Self {
        Self {
            config,
            cache,
            http,
            registry,
            connector,
            mode,
            hooks: BrowserHooks::noop(),
            state: Mutex::new(ServiceState::Created),
            transport: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            internal_listener: Mutex::new(None),
            will_seq: AtomicU32::new(1),
        }
    }

    pub fn set_browser_hooks(&mut self, hooks: BrowserHooks) {
        self.hooks = hooks;
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn profile(&self) -> TransportProfile {
        self.mode.profile()
    }

    /// The shared transport, once `init` has built it.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    fn advance(&self, to: ServiceState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance(to) {
            debug!(from = ?*state, to = ?to, "service state advanced");
            *state = to;
            true
        } else {
            warn!(from = ?*state, to = ?to, "illegal service transition ignored");
            false
        }
    }

    /// Assemble credentials, build the shared transport, connect, and
    /// install the wildcard subscription.
    pub async fn init(&self) -> ServiceResult<()> {
        if !self.advance(ServiceState::Initializing) {
            return Ok(());
        }
        match self.init_inner().await {
            Ok(()) => {
                self.advance(ServiceState::Running);
                Ok(())
            }
            Err(e) => {
                self.advance(ServiceState::Created);
                Err(e)
            }
        }
    }

    async fn init_inner(&self) -> ServiceResult<()> {
        let mqtt_password = self.cache.get_string(keys::MQTT_PASSWORD).unwrap_or_default();
        let token = self.cache.get_string(keys::TOKEN);

        let client_id = match &token {
            Some(_) => self.fetch_client_id(&mqtt_password).await?,
            // No session yet: stay a guest, no broker traffic.
            None => GUEST_CLIENT_ID.to_string(),
        };
        let scheme = TopicScheme::new(client_id.clone());

        let host = self
            .cache
            .get_string(keys::MQTT_HOST)
            .ok_or(ServiceError::missing(keys::MQTT_HOST))?;
        let protocol = self
            .cache
            .get_string(keys::MQTT_HOST_PROTOCOL)
            .ok_or(ServiceError::missing(keys::MQTT_HOST_PROTOCOL))?;
        let broker_url = format!("{protocol}://{host}/mqtt");

        let mut options = ConnectOptions::new(&client_id, &client_id, &mqtt_password);
        if let Some(token) = &token {
            let will = WillMessage::disconnect(
                &client_id,
                token,
                self.will_seq.fetch_add(1, Ordering::SeqCst),
            );
            let payload = serde_json::to_string(&will)
                .map_err(|e| ServiceError::WillEncode(e.to_string()))?;
            options = options.with_last_will(LastWillConfig {
                topic: scheme.will_topic(),
                payload,
                retain: false,
            });
        }

        let transport: Arc<dyn Transport> = match &self.mode {
            TransportMode::Direct => Arc::new(DirectTransport::new(
                self.connector.clone(),
                broker_url,
                options,
            )),
            TransportMode::Shared(handle) => Arc::new(
                SharedTransport::attach(handle.clone(), broker_url, options).await?,
            ),
        };

        self.spawn_internal_listener(transport.clone());
        *self.transport.lock() = Some(transport.clone());

        if !transport.is_guest() {
            let ack = transport.connect().await?;
            info!(client_id = %client_id, session_present = ack.session_present, "shared transport connected");
        }
        Ok(())
    }

    /// `GET /v2/client/getClientId`, honoring the shared-client-id cache.
    async fn fetch_client_id(&self, mqtt_password: &str) -> ServiceResult<String> {
        if self.profile().use_shared_client_id {
            if let Some(cached) = self.cache.get_string(keys::CLIENT_ID) {
                debug!("reusing cached client id");
                return Ok(cached);
            }
        }

        let uuid = self
            .cache
            .get_string(keys::MQTT_UUID)
            .ok_or(ServiceError::missing(keys::MQTT_UUID))?;
        let payload = self
            .http
            .get(
                CLIENT_ID_ENDPOINT,
                json!({
                    "uuid": uuid,
                    "mqttPwd": mqtt_password,
                    "type": self.config.client_kind.as_str(),
                }),
                RequestOptions::default(),
            )
            .await?;
        let envelope = payload
            .into_envelope()
            .ok_or_else(|| ServiceError::client_id("non-envelope response"))?;
        if !envelope.is_success() {
            return Err(ServiceError::client_id(envelope.desc));
        }
        let client_id = match &envelope.data {
            serde_json::Value::String(s) if !s.is_empty() => s.clone(),
            other => return Err(ServiceError::client_id(format!("unusable data: {other}"))),
        };

        if self.profile().use_shared_client_id {
            self.cache
                .set_item(keys::CLIENT_ID, json!(client_id.clone()), None);
            if let Err(e) = self.cache.flush() {
                warn!(error = %e, "client id cache write failed");
            }
        }
        Ok(client_id)
    }

    fn spawn_internal_listener(&self, transport: Arc<dyn Transport>) {
        let mut events = transport.events();
        let scheme = transport.scheme();
        let cache = self.cache.clone();
        let hooks = self.hooks.clone();
        let login_path = self.config.login_path.clone();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Connect(_)) => {
                        if let Err(e) = transport.subscribe(vec![scheme.wildcard()]).await {
                            warn!(error = %e, "wildcard subscription failed");
                        }
                    }
                    Ok(TransportEvent::End) => {
                        // Session over. Unless a token survives (plain
                        // suspend/tab close), push the user to sign-in.
                        if cache.get_persisted(keys::TOKEN).is_none() {
                            let current = (hooks.current_path)();
                            if let Some(target) = login_redirect(&login_path, &current) {
                                info!(%target, "session ended, redirecting");
                                (hooks.navigate)(target);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.internal_listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Mint a worker bound to the given transport, or to the shared one.
    pub fn create_worker(
        &self,
        transport: Option<Arc<dyn Transport>>,
    ) -> ServiceResult<Arc<Worker>> {
        let transport = match transport {
            Some(t) => t,
            None => self.transport().ok_or(ServiceError::NotInitialized)?,
        };
        let worker = Arc::new(Worker::new(
            transport,
            self.http.clone(),
            self.registry.clone(),
        ));
        self.workers.lock().push(worker.clone());
        Ok(worker)
    }

    /// Graceful teardown: every worker releases its follows (HTTP unsub
    /// calls happen), the shared transport ends, state returns to Created.
    pub async fn quit(&self) -> ServiceResult<()> {
        if !self.advance(ServiceState::Stopping) {
            return Ok(());
        }
        let workers: Vec<Arc<Worker>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.quit().await {
                warn!(error = %e, "worker quit failed");
            }
        }
        if let Some(transport) = self.transport.lock().take() {
            if let Err(e) = transport.end(false).await {
                warn!(error = %e, "transport end failed");
            }
        }
        if let Some(listener) = self.internal_listener.lock().take() {
            listener.abort();
        }
        self.advance(ServiceState::Created);
        Ok(())
    }

    /// Teardown without HTTP notifications, for when the token is already
    /// invalid. Ends every transport, including per-worker ones.
    pub async fn force_quit(&self) -> ServiceResult<()> {
        if !self.advance(ServiceState::Stopping) {
            return Ok(());
        }
        let workers: Vec<Arc<Worker>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.force_quit();
            if let Err(e) = worker.transport().end(true).await {
                warn!(error = %e, "worker transport end failed");
            }
        }
        if let Some(transport) = self.transport.lock().take() {
            if let Err(e) = transport.end(true).await {
                warn!(error = %e, "transport end failed");
            }
        }
        if let Some(listener) = self.internal_listener.lock().take() {
            listener.abort();
        }
        self.advance(ServiceState::Created);
        Ok(())
    }

    /// End the shared transport but keep workers registered.
    pub async fn suspend(&self) -> ServiceResult<()> {
        if !self.advance(ServiceState::Suspending) {
            return Ok(());
        }
        if let Some(transport) = self.transport() {
            if let Err(e) = transport.end(false).await {
                warn!(error = %e, "suspend end failed");
            }
        }
        self.advance(ServiceState::Suspended);
        Ok(())
    }

    pub async fn resume(&self) -> ServiceResult<()> {
        if !self.advance(ServiceState::Resuming) {
            return Ok(());
        }
        if let Some(transport) = self.transport() {
            transport.reconnect().await?;
        }
        self.advance(ServiceState::Running);
        Ok(())
    }

    /// `document.visibilitychange` entry point. Only transports that ask
    /// for it are suspended while hidden.
    pub async fn on_visibility_change(&self, visible: bool) -> ServiceResult<()> {
        if !self.profile().suspend_when_hidden {
            return Ok(());
        }
        if visible {
            self.resume().await
        } else {
            self.suspend().await
        }
    }

    /// `window.beforeunload` entry point.
    pub async fn on_tab_unload(&self) -> ServiceResult<()> {
        self.quit().await
    }
}
