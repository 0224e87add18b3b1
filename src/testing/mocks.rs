//! Mock transport and connector for testing
//!
//! `MockTransport` records everything handed to it and can be scripted to fail.
//! Clones share state, so a test keeps a probe while the connection handle owns
//! the transport. `MockConnector` plays the broker client's event loop: it
//! emits connect acknowledgments, disconnects and inbound messages tagged with
//! the right generation.

use crate::transport::{
    ConnectOptions, Connector, EventSender, InboundMessage, QosLevel, Transport, TransportEvent,
    TransportEventKind, CONNECT_ACCEPTED,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MockError {
    #[error("Mock transport not connected")]
    NotConnected,
    #[error("Mock publish failure")]
    PublishRejected,
    #[error("Mock subscribe failure")]
    SubscribeRejected,
    #[error("Mock connector failure")]
    OpenFailed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct MockState {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    // Remaining successful publishes before every publish fails
    publish_budget: Mutex<Option<usize>>,
    // Publishes to reject before accepting again
    pending_failures: AtomicUsize,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<(String, QosLevel)>>,
    disconnect_calls: AtomicUsize,
}

/// Scriptable in-memory transport
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Transport whose session is not up yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport with an established session
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.set_connected(true);
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail every publish while set
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Let the next `successes` publishes through, then fail the rest
    pub fn fail_after(&self, successes: usize) {
        *lock(&self.state.publish_budget) = Some(successes);
    }

    /// Reject the next `failures` publishes, then accept again
    pub fn fail_next(&self, failures: usize) {
        self.state.pending_failures.store(failures, Ordering::SeqCst);
    }

    /// Remove any publish failure scripting
    pub fn heal(&self) {
        self.set_fail_publish(false);
        self.fail_next(0);
        *lock(&self.state.publish_budget) = None;
    }

    /// Published messages with their payload decoded from JSON
    pub fn published(&self) -> Vec<(String, Value)> {
        lock(&self.state.published)
            .iter()
            .map(|(topic, bytes)| {
                let payload = serde_json::from_slice(bytes).unwrap_or(Value::Null);
                (topic.clone(), payload)
            })
            .collect()
    }

    /// Published messages as raw bytes
    pub fn published_raw(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state.published).clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.state.published)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        lock(&self.state.subscriptions).clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.disconnect_calls.load(Ordering::SeqCst)
    }

    fn take_publish_slot(&self) -> bool {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return false;
        }
        let pending = self.state.pending_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if pending.is_ok() {
            return false;
        }
        let mut budget = lock(&self.state.publish_budget);
        match budget.as_mut() {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockError;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MockError::NotConnected);
        }
        if !self.take_publish_slot() {
            return Err(MockError::PublishRejected);
        }
        lock(&self.state.published).push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MockError::NotConnected);
        }
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MockError::SubscribeRejected);
        }
        lock(&self.state.subscriptions).push((filter.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct OpenedTransport {
    options: ConnectOptions,
    transport: MockTransport,
    events: EventSender,
}

#[derive(Debug, Default)]
struct ConnectorState {
    fail_open: AtomicBool,
    accept_on_open: AtomicBool,
    opened: Mutex<Vec<OpenedTransport>>,
}

/// Connector that hands out `MockTransport`s and lets tests drive their events
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Accept every connect from inside `open`, before the caller has the
    /// transport back
    pub fn set_accept_on_open(&self, accept: bool) {
        self.state.accept_on_open.store(accept, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state.opened).len()
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        lock(&self.state.opened).last().map(|o| o.options.clone())
    }

    /// Shared probe on the most recently opened transport
    pub fn last_transport(&self) -> Option<MockTransport> {
        lock(&self.state.opened).last().map(|o| o.transport.clone())
    }

    fn emit(&self, kind: TransportEventKind) {
        if let Some(opened) = lock(&self.state.opened).last() {
            let _ = opened
                .events
                .send(TransportEvent::new(opened.options.generation, kind));
        }
    }

    /// Broker answers the latest connect with `code`
    pub fn acknowledge(&self, code: u8) {
        if let Some(transport) = self.last_transport() {
            transport.set_connected(code == CONNECT_ACCEPTED);
        }
        self.emit(TransportEventKind::ConnectAck(code));
    }

    /// The latest session ends with `code`
    pub fn drop_connection(&self, code: u8) {
        if let Some(transport) = self.last_transport() {
            transport.set_connected(false);
        }
        self.emit(TransportEventKind::Disconnect(code));
    }

    /// The latest transport announces a retry
    pub fn reconnecting(&self, attempt: u32) {
        self.emit(TransportEventKind::Reconnecting { attempt });
    }

    /// A message arrives on a subscribed filter
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.emit(TransportEventKind::Message(InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        }));
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn open(&self, options: &ConnectOptions, events: EventSender) -> Result<MockTransport, MockError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(MockError::OpenFailed);
        }

        let transport = MockTransport::new();
        if self.state.accept_on_open.load(Ordering::SeqCst) {
            transport.set_connected(true);
            let _ = events.send(TransportEvent::new(
                options.generation,
                TransportEventKind::ConnectAck(CONNECT_ACCEPTED),
            ));
        }
        lock(&self.state.opened).push(OpenedTransport {
            options: options.clone(),
            transport: transport.clone(),
            events,
        });
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_after_budget() {
        let transport = MockTransport::connected();
        transport.fail_after(1);

        assert!(transport.publish("a", b"1".to_vec()).await.is_ok());
        assert_eq!(
            transport.publish("a", b"2".to_vec()).await,
            Err(MockError::PublishRejected)
        );

        transport.heal();
        assert!(transport.publish("a", b"3".to_vec()).await.is_ok());
        assert_eq!(transport.published_topics(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_fail_next_recovers() {
        let transport = MockTransport::connected();
        transport.fail_next(2);

        assert!(transport.publish("a", b"1".to_vec()).await.is_err());
        assert!(transport.publish("a", b"2".to_vec()).await.is_err());
        assert!(transport.publish("a", b"3".to_vec()).await.is_ok());
        assert_eq!(transport.published_raw(), vec![("a".to_string(), b"3".to_vec())]);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let transport = MockTransport::new();
        let probe = transport.clone();

        assert_eq!(
            transport.publish("a", b"1".to_vec()).await,
            Err(MockError::NotConnected)
        );
        probe.set_connected(true);
        assert!(transport.publish("a", b"1".to_vec()).await.is_ok());
        assert_eq!(probe.published_raw(), vec![("a".to_string(), b"1".to_vec())]);
    }

    #[tokio::test]
    async fn test_connector_tags_events_with_generation() {
        let connector = MockConnector::new();
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let options = ConnectOptions {
            client_id: "jetson-01".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            generation: 4,
        };

        let transport = connector.open(&options, events_tx).unwrap();
        connector.acknowledge(0);

        assert!(transport.is_connected());
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event, TransportEvent::new(4, TransportEventKind::ConnectAck(0)));
    }
}
