//! Cross-tab shared host behavior: one real client, late joiners served
//! by unicast, session-over broadcast.

use eventmux::protocol::{ConnectOptions, PacketMeta};
use eventmux::testing::mocks::MockConnector;
use eventmux::transport::{SharedHost, SharedTransport, Transport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;

fn options() -> ConnectOptions {
    let mut opts = ConnectOptions::new("CID", "CID", "pwd");
    opts.connect_timeout_ms = 1_000;
    opts
}

#[tokio::test]
async fn late_joining_tab_settles_without_broker_traffic() {
    let connector = Arc::new(MockConnector::new());
    let host = SharedHost::spawn(connector.clone());

    let tab_a = SharedTransport::attach(host.clone(), "mqtt://broker.local", options())
        .await
        .unwrap();
    let ack = tab_a.connect().await.unwrap();
    assert_eq!(ack.return_code, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let tab_b = SharedTransport::attach(host, "mqtt://broker.local", options())
        .await
        .unwrap();
    let ack = tab_b.connect().await.unwrap();
    assert_eq!(ack.return_code, 0);
    assert!(tab_b.is_connected());

    // One MqttConnect ever reached the connector
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn broker_messages_broadcast_to_every_tab() {
    let connector = Arc::new(MockConnector::new());
    let host = SharedHost::spawn(connector.clone());

    let tab_a = SharedTransport::attach(host.clone(), "mqtt://broker.local", options())
        .await
        .unwrap();
    tab_a.connect().await.unwrap();
    let tab_b = SharedTransport::attach(host, "mqtt://broker.local", options())
        .await
        .unwrap();
    tab_b.connect().await.unwrap();

    let mut events_a = tab_a.events();
    let mut events_b = tab_b.events();

    connector.emit(eventmux::transport::link::LinkEvent::Message {
        topic: "iot/v1/c/CID/log/detail".to_string(),
        payload: b"{}".to_vec(),
        packet: PacketMeta::default(),
    });

    for events in [&mut events_a, &mut events_b] {
        loop {
            match tokio::time::timeout(Duration::from_millis(500), events.recv())
                .await
                .expect("message never arrived")
                .unwrap()
            {
                TransportEvent::Message { topic, .. } => {
                    assert_eq!(topic, "iot/v1/c/CID/log/detail");
                    break;
                }
                _ => continue,
            }
        }
    }
}

#[tokio::test]
async fn forced_end_is_session_over_for_every_tab() {
    let connector = Arc::new(MockConnector::new());
    let host = SharedHost::spawn(connector.clone());

    let tab_a = SharedTransport::attach(host.clone(), "mqtt://broker.local", options())
        .await
        .unwrap();
    tab_a.connect().await.unwrap();
    let tab_b = SharedTransport::attach(host, "mqtt://broker.local", options())
        .await
        .unwrap();
    tab_b.connect().await.unwrap();
    let mut events_a = tab_a.events();

    tab_b.end(true).await.unwrap();

    loop {
        match tokio::time::timeout(Duration::from_millis(500), events_a.recv())
            .await
            .expect("surviving tab never heard the end")
            .unwrap()
        {
            TransportEvent::End => break,
            _ => continue,
        }
    }
    assert!(!tab_a.is_connected());
    assert_eq!(connector.link_calls().disconnects, 1);
}

#[tokio::test]
async fn detached_tab_stops_receiving() {
    let connector = Arc::new(MockConnector::new());
    let host = SharedHost::spawn(connector.clone());

    let tab_a = SharedTransport::attach(host.clone(), "mqtt://broker.local", options())
        .await
        .unwrap();
    tab_a.connect().await.unwrap();
    let tab_b = SharedTransport::attach(host, "mqtt://broker.local", options())
        .await
        .unwrap();
    tab_b.connect().await.unwrap();

    let mut events_a = tab_a.events();
    let mut events_b = tab_b.events();
    tab_a.detach();
    tokio::time::sleep(Duration::from_millis(50)).await;

    connector.emit(eventmux::transport::link::LinkEvent::Message {
        topic: "iot/v1/c/CID/log/detail".to_string(),
        payload: b"{}".to_vec(),
        packet: PacketMeta::default(),
    });

    // Tab B still receives
    loop {
        match tokio::time::timeout(Duration::from_millis(500), events_b.recv())
            .await
            .expect("message never arrived")
            .unwrap()
        {
            TransportEvent::Message { .. } => break,
            _ => continue,
        }
    }
    // Tab A's port is closed; nothing arrives
    let got = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match events_a.recv().await {
                Ok(TransportEvent::Message { .. }) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await;
    assert!(matches!(got, Err(_) | Ok(false)));
}
