//! Broker messages reach exactly the workers whose follows map to the
//! topic, through a real direct transport over a mock link.

mod common;

use common::{http_client, registry_over, seeded_cache};
use eventmux::cache::MemoryStorage;
use eventmux::protocol::{Business, ConnectOptions, PacketMeta};
use eventmux::testing::mocks::MockConnector;
use eventmux::transport::link::LinkEvent;
use eventmux::transport::{DirectTransport, Transport};
use eventmux::worker::Worker;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn connected_transport(connector: Arc<MockConnector>) -> Arc<DirectTransport> {
    let transport = Arc::new(DirectTransport::new(
        connector,
        "mqtt://broker.local",
        ConnectOptions::new("CID", "CID", "pwd"),
    ));
    transport.connect().await.unwrap();
    transport
}

#[tokio::test]
async fn message_lands_only_in_the_matching_worker() {
    let connector = Arc::new(MockConnector::new());
    let transport = connected_transport(connector.clone()).await;

    let storage = Arc::new(MemoryStorage::new());
    let http = http_client("http://127.0.0.1:9", seeded_cache(storage.clone()));
    let registry = registry_over(storage);

    let interested = Worker::new(transport.clone(), http.clone(), registry.clone());
    let bystander = Worker::new(transport.clone(), http, registry);

    let followed = Business::unrouted("log/detail");
    let other = Business::unrouted("layout_device/status");
    interested.watch(&followed).await.unwrap();
    bystander.watch(&other).await.unwrap();

    connector.emit(LinkEvent::Message {
        topic: "iot/v1/c/CID/log/detail".to_string(),
        payload: br#"{"payload":{"x":1}}"#.to_vec(),
        packet: PacketMeta::default(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one digest invocation, in exactly one worker
    assert_eq!(
        interested.latest(&followed),
        Some(json!({"payload": {"x": 1}}))
    );
    assert_eq!(bystander.latest(&other), None);
}

#[tokio::test]
async fn both_follows_on_one_subject_receive_the_message() {
    // Carried-forward limitation: subject-only routing cannot separate
    // two bids on the same subject.
    let connector = Arc::new(MockConnector::new());
    let transport = connected_transport(connector.clone()).await;

    let storage = Arc::new(MemoryStorage::new());
    let worker = Worker::new(
        transport.clone(),
        http_client("http://127.0.0.1:9", seeded_cache(storage.clone())),
        registry_over(storage),
    );

    let one = Business::new("log/detail", "B1");
    let two = Business::new("log/detail", "B2");
    worker.watch(&one).await.unwrap();
    worker.watch(&two).await.unwrap();

    connector.emit(LinkEvent::Message {
        topic: "iot/v1/c/CID/log/detail".to_string(),
        payload: br#"{"n":7}"#.to_vec(),
        packet: PacketMeta::default(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Both identities store the payload; neither can be singled out
    assert_eq!(worker.latest(&one), Some(json!({"n": 7})));
    assert_eq!(worker.latest(&two), Some(json!({"n": 7})));
}

#[tokio::test]
async fn latest_payload_is_keyed_by_follow_identity() {
    let connector = Arc::new(MockConnector::new());
    let transport = connected_transport(connector.clone()).await;

    let storage = Arc::new(MemoryStorage::new());
    let worker = Worker::new(
        transport.clone(),
        http_client("http://127.0.0.1:9", seeded_cache(storage.clone())),
        registry_over(storage),
    );

    let b = Business::unrouted("log/detail");
    worker.watch(&b).await.unwrap();

    connector.emit(LinkEvent::Message {
        topic: "iot/v1/c/CID/log/detail".to_string(),
        payload: br#"{"seq":1}"#.to_vec(),
        packet: PacketMeta::default(),
    });
    connector.emit(LinkEvent::Message {
        topic: "iot/v1/c/CID/log/detail".to_string(),
        payload: br#"{"seq":2}"#.to_vec(),
        packet: PacketMeta::default(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Broker order is preserved; the slot holds the newest payload
    assert_eq!(worker.latest(&b), Some(json!({"seq": 2})));
}
