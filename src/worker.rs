//! Per-component worker: multiplexes one UI component's follows onto the
//! shared transport.
//!
//! A worker holds the set of businesses its component follows, filters
//! broker messages down to those subjects, and drives the interest
//! notifications: the first watcher anywhere triggers `notify/sub`, the
//! last release triggers `notify/unsub`. Routing is by subject alone; two
//! follows on the same subject with different bids both receive the
//! message, which the reference counter cannot fix.

use crate::http::{HttpClient, HttpError, RequestOptions};
use crate::interest::InterestRegistry;
use crate::protocol::{notify_topic, Business, NotifyBody, PacketMeta, TopicScheme};
use crate::transport::{Transport, TransportEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NOTIFY_SUB: &str = "/v2/client/notify/sub";
const NOTIFY_UNSUB: &str = "/v2/client/notify/unsub";

/// Decodes a raw broker payload (plus its delivery metadata) into the
/// latest-value slot of one follow.
pub type Digest = Arc<dyn Fn(&[u8], &PacketMeta) -> Option<Value> + Send + Sync>;

fn default_digest() -> Digest {
    Arc::new(|payload, _packet| serde_json::from_slice(payload).ok())
}

#[derive(Default)]
struct WorkerState {
    follows: HashMap<String, Business>,
    latest: HashMap<String, Value>,
    digests: HashMap<String, Digest>,
    api_aware: HashSet<String>,
}

pub struct Worker {
    transport: Arc<dyn Transport>,
    http: HttpClient,
    registry: Arc<InterestRegistry>,
    scheme: TopicScheme,
    state: Arc<Mutex<WorkerState>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        transport: Arc<dyn Transport>,
        http: HttpClient,
        registry: Arc<InterestRegistry>,
    ) -> Self {
        let scheme = transport.scheme();
        let state = Arc::new(Mutex::new(WorkerState::default()));
        let listener = Self::spawn_listener(transport.clone(), scheme.clone(), state.clone());
        Self {
            transport,
            http,
            registry,
            scheme,
            state,
            listener: Mutex::new(Some(listener)),
        }
    }

    fn spawn_listener(
        transport: Arc<dyn Transport>,
        scheme: TopicScheme,
        state: Arc<Mutex<WorkerState>>,
    ) -> JoinHandle<()> {
        let mut events = transport.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Message {
                        topic,
                        payload,
                        packet,
                    }) => {
                        let mut state = state.lock();
                        let matching: Vec<String> = state
                            .follows
                            .values()
                            .filter(|b| scheme.client_topic(&b.subject) == topic)
                            .map(|b| b.identity())
                            .collect();
                        for identity in matching {
                            if let Some(digest) = state.digests.get(&identity).cloned() {
                                // One bad payload must not abort the fan-out.
                                if let Some(value) = digest(&payload, &packet) {
                                    state.latest.insert(identity, value);
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "worker listener lagged behind the transport");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Follow a business with the default JSON digest.
    pub async fn watch(&self, business: &Business) -> Result<(), HttpError> {
        self.watch_with_digest(business, default_digest()).await
    }

    /// Follow a business, decoding its payloads with a custom digest.
    pub async fn watch_with_digest(
        &self,
        business: &Business,
        digest: Digest,
    ) -> Result<(), HttpError> {
        if self.transport.is_guest() {
            return Ok(());
        }
        let identity = business.identity();
        {
            let state = self.state.lock();
            let already_watching = state.follows.contains_key(&identity);
            if already_watching
                && (business.bid.is_none() || state.api_aware.contains(&identity))
            {
                return Ok(());
            }
        }

        if let Some(bid) = &business.bid {
            let reference = self.registry.collect(business).await;
            let api_aware = self.state.lock().api_aware.contains(&identity);
            if reference == 1 && !api_aware {
                self.notify(NOTIFY_SUB, bid, &business.subject).await?;
                self.state.lock().api_aware.insert(identity.clone());
                debug!(%identity, "interest announced");
            }
        }

        let mut state = self.state.lock();
        state.follows.insert(identity.clone(), business.clone());
        state.digests.insert(identity, digest);
        Ok(())
    }

    /// Stop following a business; tells the backend when the last watcher
    /// anywhere is gone.
    pub async fn unwatch(&self, business: &Business) -> Result<(), HttpError> {
        if self.transport.is_guest() {
            return Ok(());
        }
        let identity = business.identity();
        if !self.state.lock().follows.contains_key(&identity) {
            return Ok(());
        }

        if let Some(bid) = &business.bid {
            let reference = self.registry.release(business).await;
            if reference == 0 {
                self.notify(NOTIFY_UNSUB, bid, &business.subject).await?;
                self.state.lock().api_aware.remove(&identity);
                debug!(%identity, "interest withdrawn");
            }
        }

        let mut state = self.state.lock();
        state.follows.remove(&identity);
        state.latest.remove(&identity);
        state.digests.remove(&identity);
        Ok(())
    }

    /// Release every follow, notifying the backend where counts reach
    /// zero, then detach from the transport.
    pub async fn quit(&self) -> Result<(), HttpError> {
        let follows: Vec<Business> = self.state.lock().follows.values().cloned().collect();
        for business in follows {
            self.unwatch(&business).await?;
        }
        self.detach();
        Ok(())
    }

    /// Drop everything without HTTP notifications. Used when the token is
    /// already invalid.
    pub fn force_quit(&self) {
        let mut state = self.state.lock();
        state.follows.clear();
        state.latest.clear();
        state.digests.clear();
        state.api_aware.clear();
        drop(state);
        self.detach();
    }

    fn detach(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    async fn notify(&self, endpoint: &str, bid: &str, subject: &str) -> Result<(), HttpError> {
        let body = NotifyBody {
            bid: bid.to_string(),
            topic: notify_topic(subject),
            client_id: self.scheme.client_id().to_string(),
        };
        let params = serde_json::to_value(&body)
            .map_err(|e| HttpError::Build(e.to_string()))?;
        self.http
            .post(endpoint, params, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// The transport this worker listens on.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Latest decoded payload for a follow, if any arrived.
    pub fn latest(&self, business: &Business) -> Option<Value> {
        self.state.lock().latest.get(&business.identity()).cloned()
    }

    pub fn is_watching(&self, business: &Business) -> bool {
        self.state.lock().follows.contains_key(&business.identity())
    }

    pub fn is_api_aware(&self, business: &Business) -> bool {
        self.state
            .lock()
            .api_aware
            .contains(&business.identity())
    }

    pub fn follow_count(&self) -> usize {
        self.state.lock().follows.len()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache, MemoryStorage, PersistentCache};
    use crate::http::{ApiBase, HttpSettings};
    use crate::testing::mocks::MockTransport;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_for(server_uri: &str) -> HttpClient {
        let cache = Arc::new(MemoryCache::new());
        cache.set_item("token", json!("a.b.c"), None);
        let settings = HttpSettings {
            origin: server_uri.to_string(),
            base: ApiBase::Api,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
            language: None,
        };
        HttpClient::new(&settings, cache).unwrap()
    }

    fn shared_registry() -> Arc<InterestRegistry> {
        Arc::new(InterestRegistry::new(Arc::new(PersistentCache::new(
            Arc::new(MemoryStorage::new()),
        ))))
    }

    fn ok_envelope() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"code": 200, "data": {}, "desc": "ok"}))
    }

    #[tokio::test]
    async fn test_first_watch_posts_notify_sub() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/sub"))
            .and(body_json(json!({
                "bid": "B1",
                "topic": "iot/v1/c/uuid/log/detail",
                "clientId": "CID"
            })))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let transport = Arc::new(MockTransport::new("CID"));
        let worker = Worker::new(transport, http_for(&server.uri()), shared_registry());

        let b = Business::new("log/detail", "B1");
        worker.watch(&b).await.unwrap();
        assert!(worker.is_watching(&b));
        assert!(worker.is_api_aware(&b));
    }

    #[tokio::test]
    async fn test_two_watchers_post_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/sub"))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let transport = Arc::new(MockTransport::new("CID"));
        let registry = shared_registry();
        let worker_a = Worker::new(transport.clone(), http_for(&server.uri()), registry.clone());
        let worker_b = Worker::new(transport, http_for(&server.uri()), registry);

        let b = Business::new("log/detail", "B1");
        worker_a.watch(&b).await.unwrap();
        worker_b.watch(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsub_only_when_last_watcher_releases() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/sub"))
            .respond_with(ok_envelope())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/unsub"))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let transport = Arc::new(MockTransport::new("CID"));
        let registry = shared_registry();
        let worker_a = Worker::new(transport.clone(), http_for(&server.uri()), registry.clone());
        let worker_b = Worker::new(transport, http_for(&server.uri()), registry);

        let b = Business::new("log/detail", "B1");
        worker_a.watch(&b).await.unwrap();
        worker_b.watch(&b).await.unwrap();

        // First release leaves the global count at 1: no unsub yet
        worker_a.unwatch(&b).await.unwrap();
        // Second release reaches zero: exactly one unsub
        worker_b.unwatch(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_without_bid_skips_http() {
        // No mock server mounted: any HTTP call would fail the test
        let transport = Arc::new(MockTransport::new("CID"));
        let worker = Worker::new(transport, http_for("http://127.0.0.1:9"), shared_registry());

        let b = Business::unrouted("layout_device/status");
        worker.watch(&b).await.unwrap();
        assert!(worker.is_watching(&b));
        assert!(!worker.is_api_aware(&b));

        worker.unwatch(&b).await.unwrap();
        assert!(!worker.is_watching(&b));
    }

    #[tokio::test]
    async fn test_message_routing_by_subject() {
        let transport = Arc::new(MockTransport::new("CID"));
        let worker = Worker::new(
            transport.clone(),
            http_for("http://127.0.0.1:9"),
            shared_registry(),
        );
        let followed = Business::unrouted("log/detail");
        let bystander = Business::unrouted("other/subject");
        worker.watch(&followed).await.unwrap();
        worker.watch(&bystander).await.unwrap();

        transport.emit_message("iot/v1/c/CID/log/detail", br#"{"payload":{"x":1}}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(worker.latest(&followed), Some(json!({"payload": {"x": 1}})));
        assert_eq!(worker.latest(&bystander), None);
    }

    #[tokio::test]
    async fn test_foreign_topic_is_ignored() {
        let transport = Arc::new(MockTransport::new("CID"));
        let worker = Worker::new(
            transport.clone(),
            http_for("http://127.0.0.1:9"),
            shared_registry(),
        );
        let b = Business::unrouted("log/detail");
        worker.watch(&b).await.unwrap();

        transport.emit_message("iot/v1/c/SOMEONE_ELSE/log/detail", b"{}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.latest(&b), None);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_swallowed() {
        let transport = Arc::new(MockTransport::new("CID"));
        let worker = Worker::new(
            transport.clone(),
            http_for("http://127.0.0.1:9"),
            shared_registry(),
        );
        let b = Business::unrouted("log/detail");
        worker.watch(&b).await.unwrap();

        transport.emit_message("iot/v1/c/CID/log/detail", b"not json");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.latest(&b), None);

        // The listener survives and processes the next message
        transport.emit_message("iot/v1/c/CID/log/detail", br#"{"ok":true}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.latest(&b), Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_guest_watch_is_a_no_op() {
        let transport = Arc::new(MockTransport::new(crate::protocol::GUEST_CLIENT_ID));
        let worker = Worker::new(transport, http_for("http://127.0.0.1:9"), shared_registry());

        let b = Business::new("log/detail", "B1");
        worker.watch(&b).await.unwrap();
        assert!(!worker.is_watching(&b));
    }

    #[tokio::test]
    async fn test_quit_releases_and_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/sub"))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/unsub"))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let transport = Arc::new(MockTransport::new("CID"));
        let worker = Worker::new(transport, http_for(&server.uri()), shared_registry());
        worker.watch(&Business::new("log/detail", "B1")).await.unwrap();

        worker.quit().await.unwrap();
        assert_eq!(worker.follow_count(), 0);
    }

    #[tokio::test]
    async fn test_force_quit_skips_http_and_keeps_registry_counts() {
        let transport = Arc::new(MockTransport::new("CID"));
        let registry = shared_registry();
        let worker = Worker::new(transport, http_for("http://127.0.0.1:9"), registry.clone());

        let b = Business::new("log/detail", "B1");
        worker.watch(&b).await.unwrap();
        assert_eq!(registry.get_reference(&b).await, 1);

        // No release, no unsub POST: the count is left to other realms
        worker.force_quit();
        assert_eq!(worker.follow_count(), 0);
        assert_eq!(registry.get_reference(&b).await, 1);
    }

    #[tokio::test]
    async fn test_watch_unwatch_roundtrip_is_server_neutral() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/sub"))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/building/v2/client/notify/unsub"))
            .respond_with(ok_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let transport = Arc::new(MockTransport::new("CID"));
        let registry = shared_registry();
        let worker = Worker::new(transport, http_for(&server.uri()), registry.clone());

        let b = Business::new("log/detail", "B1");
        worker.watch(&b).await.unwrap();
        worker.unwatch(&b).await.unwrap();

        // Sub followed by unsub: the server-side interest state is back to
        // where it started
        assert_eq!(registry.get_reference(&b).await, 0);
        assert!(!worker.is_api_aware(&b));
    }
}
