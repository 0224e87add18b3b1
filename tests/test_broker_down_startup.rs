//! Startup against an unreachable broker
//!
//! Uses the real MQTT transport pointed at a closed loopback port:
//! - The connect call itself succeeds; the failure arrives as an event
//! - The transport announces retries on its backoff schedule
//! - Publishes keep working and land in the outbox


use edgepub::config::{MqttSection, ReconnectSection};
use edgepub::link::{ConnectionState, LinkManager, SubscriptionSet};
use edgepub::publisher::Outcome;
use edgepub::transport::mqtt::MqttConnector;
use edgepub::transport::{TransportEventKind, CONNECT_SERVER_UNAVAILABLE};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

fn unreachable_section() -> MqttSection {
    MqttSection {
        reconnect: ReconnectSection {
            max_attempts: Some(2),
            backoff_pattern_ms: vec![10, 20],
            sustained_delay_ms: 20,
        },
        ..MqttSection::default()
    }
}

#[tokio::test]
async fn test_unreachable_broker_reports_failure_and_retries() {
    // Arrange: nothing listens on port 1
    let connector = MqttConnector::new(unreachable_section());
    let (manager, mut events) = LinkManager::new(connector, test_helpers::publisher(10));

    // Act
    let handle = manager
        .connect("startup-test", "127.0.0.1", 1, SubscriptionSet::default(), None)
        .await
        .expect("connect succeeds locally even if the broker is down");

    // Assert: the refusal arrives as an event and moves the state machine
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("failure reported in time")
        .expect("channel open");
    assert_eq!(event.generation, handle.generation());
    assert_eq!(event.kind, TransportEventKind::ConnectAck(CONNECT_SERVER_UNAVAILABLE));
    manager.handle_event(event).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("retry announced in time")
        .expect("channel open");
    assert_eq!(event.kind, TransportEventKind::Reconnecting { attempt: 1 });
    manager.handle_event(event).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    // Publishing while the broker is down buffers the message
    assert_eq!(manager.publish("alerts", json!({"n": 1}), true).await, Outcome::Enqueued);
    assert_eq!(manager.publisher().outbox().len(), 1);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.publisher().outbox().len(), 1);
}
