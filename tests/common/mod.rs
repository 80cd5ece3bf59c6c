//! Shared builders for integration tests.

use eventmux::cache::{keys, Cache, MemoryStorage, PersistentCache};
use eventmux::config::ServiceConfig;
use eventmux::http::{ApiBase, HttpClient, HttpSettings};
use eventmux::interest::InterestRegistry;
use eventmux::protocol::ClientKind;
use eventmux::service::{Service, TransportMode};
use eventmux::testing::mocks::MockConnector;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[allow(dead_code)]
pub fn http_settings(origin: &str) -> HttpSettings {
    HttpSettings {
        origin: origin.to_string(),
        base: ApiBase::Api,
        user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
        language: None,
    }
}

/// Cache seeded the way the login flow would leave it.
#[allow(dead_code)]
pub fn seeded_cache(storage: Arc<MemoryStorage>) -> Arc<dyn Cache> {
    let cache = PersistentCache::new(storage);
    cache.set_item(keys::TOKEN, json!("aaa.bbb.ccc"), None);
    cache.set_item(keys::MQTT_PASSWORD, json!("pwd"), None);
    cache.set_item(keys::MQTT_UUID, json!("uuid-1"), None);
    cache.set_item(keys::MQTT_HOST, json!("broker.example.com"), None);
    cache.set_item(keys::MQTT_HOST_PROTOCOL, json!("mqtt"), None);
    cache.flush().unwrap();
    Arc::new(cache)
}

#[allow(dead_code)]
pub fn http_client(origin: &str, cache: Arc<dyn Cache>) -> HttpClient {
    HttpClient::new(&http_settings(origin), cache).unwrap()
}

#[allow(dead_code)]
pub fn registry_over(storage: Arc<MemoryStorage>) -> Arc<InterestRegistry> {
    Arc::new(InterestRegistry::new(Arc::new(PersistentCache::new(
        storage,
    ))))
}

#[allow(dead_code)]
pub fn service(
    origin: &str,
    cache: Arc<dyn Cache>,
    connector: Arc<MockConnector>,
    mode: TransportMode,
) -> Service {
    let settings = http_settings(origin);
    let http = HttpClient::new(&settings, cache.clone()).unwrap();
    let registry = Arc::new(InterestRegistry::new(cache.clone()));
    let config = ServiceConfig {
        http: settings,
        client_kind: ClientKind::BasePage,
        login_path: "/login".to_string(),
        cache_file: None,
    };
    Service::new(config, cache, http, registry, connector, mode)
}

/// Mount the client-id endpoint answering `CID`.
#[allow(dead_code)]
pub async fn mount_client_id(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/building/v2/client/getClientId"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"code": 200, "data": "CID", "desc": "ok"})),
        )
        .mount(server)
        .await;
}

/// Success envelope every notify endpoint answers with.
#[allow(dead_code)]
pub fn ok_envelope() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"code": 200, "data": {}, "desc": "ok"}))
}
