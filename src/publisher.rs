//! Publish attempts and outbox draining
//!
//! Every publish runs "drain, send, fall back to the outbox" while holding the
//! publisher's send gate. The on-connect drain takes the same gate, so
//! publishes are totally ordered, nothing is appended to the outbox while a
//! drain is walking it, and no message is sent twice.

use crate::error::PublishError;
use crate::link::ConnectionHandle;
use crate::observability::MetricsCollector;
use crate::outbox::{Outbox, QueuedMessage};
use crate::protocol::validate_publish_topic;
use crate::transport::Transport;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What happened to one publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The transport accepted the message
    Sent,
    /// Stored in the outbox for a later drain
    Enqueued,
    /// The outbox was full
    Dropped,
    /// Not sent and not queued, by request or because it can never be sent
    Discarded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Sent => "sent",
            Outcome::Enqueued => "enqueued",
            Outcome::Dropped => "dropped",
            Outcome::Discarded => "discarded",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends messages through the current connection handle, buffering in the
/// outbox what cannot be sent.
pub struct Publisher {
    outbox: Arc<Outbox>,
    gate: Mutex<()>,
    metrics: Arc<MetricsCollector>,
}

impl Publisher {
    pub fn new(outbox: Arc<Outbox>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            outbox,
            gate: Mutex::new(()),
            metrics,
        }
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Publish one JSON payload.
    ///
    /// Never fails: every error is logged and folded into the returned
    /// [`Outcome`].
    pub async fn publish<T: Transport>(
        &self,
        handle: Option<&ConnectionHandle<T>>,
        topic: &str,
        payload: Value,
        enqueue_on_failure: bool,
    ) -> Outcome {
        if let Err(e) = validate_publish_topic(topic) {
            return self.discard(topic, &PublishError::InvalidTopic(e));
        }

        let _gate = self.gate.lock().await;

        let Some(handle) = handle else {
            return self.fall_back(topic, payload, enqueue_on_failure, &PublishError::NotConnected);
        };

        // Older messages go first. A drain over a dead session could only
        // fail on its first send, so it is skipped.
        if handle.is_connected() && !self.drain_locked(handle).await {
            let queued = self.outbox.len();
            warn!(topic, queued, "Outbox drain incomplete, broker connectivity degraded");

            // A message that may be queued never overtakes the backlog. One
            // that opted out of the outbox still gets its single attempt.
            if enqueue_on_failure {
                return self.fall_back(topic, payload, true, &PublishError::BacklogPending { queued });
            }
        }

        match handle.send(topic, &payload).await {
            Ok(()) => {
                self.metrics.message_sent();
                info!(topic, outcome = %Outcome::Sent, "Message sent");
                debug!(topic, %payload, "Sent payload");
                Outcome::Sent
            }
            Err(e) => self.fall_back(topic, payload, enqueue_on_failure, &e),
        }
    }

    /// Serialize any value to JSON and publish it
    pub async fn publish_json<T: Transport, S: Serialize>(
        &self,
        handle: Option<&ConnectionHandle<T>>,
        topic: &str,
        message: &S,
        enqueue_on_failure: bool,
    ) -> Outcome {
        match serde_json::to_value(message) {
            Ok(payload) => self.publish(handle, topic, payload, enqueue_on_failure).await,
            Err(e) => self.discard(topic, &PublishError::Serialization(e)),
        }
    }

    /// Send queued messages oldest first until the outbox is empty or a send
    /// fails. Returns true iff the outbox was fully emptied.
    pub async fn drain<T: Transport>(&self, handle: &ConnectionHandle<T>) -> bool {
        let _gate = self.gate.lock().await;
        self.drain_locked(handle).await
    }

    async fn drain_locked<T: Transport>(&self, handle: &ConnectionHandle<T>) -> bool {
        if self.outbox.is_empty() {
            return true;
        }

        let started = Instant::now();
        let mut sent = 0usize;

        let emptied = loop {
            let Some(head) = self.outbox.peek() else {
                break true;
            };

            debug!(topic = %head.topic, "Sending queued message");
            match handle.send(&head.topic, &head.payload).await {
                Ok(()) => {
                    self.outbox.pop();
                    sent += 1;
                    self.metrics.message_sent();
                    info!(topic = %head.topic, outcome = %Outcome::Sent, "Queued message sent");
                }
                Err(e) => {
                    debug!(
                        topic = %head.topic,
                        remaining = self.outbox.len(),
                        "Drain stopped: {}", e
                    );
                    break false;
                }
            }
        };

        self.metrics
            .drain_finished(emptied, sent, started.elapsed());
        self.metrics.outbox_depth_changed(self.outbox.len());
        emptied
    }

    /// Enqueue, drop or discard a message that was not sent
    fn fall_back(
        &self,
        topic: &str,
        payload: Value,
        enqueue_on_failure: bool,
        reason: &PublishError,
    ) -> Outcome {
        if !enqueue_on_failure {
            return self.discard(topic, reason);
        }

        if self.outbox.enqueue(QueuedMessage::new(topic, payload)) {
            self.metrics.message_enqueued();
            self.metrics.outbox_depth_changed(self.outbox.len());
            info!(
                topic,
                outcome = %Outcome::Enqueued,
                queued = self.outbox.len(),
                reason = %reason,
                "Message enqueued"
            );
            Outcome::Enqueued
        } else {
            let full = PublishError::QueueFull {
                capacity: self.outbox.capacity(),
            };
            self.metrics.message_dropped();
            error!(
                topic,
                outcome = %Outcome::Dropped,
                reason = %reason,
                "{}", full
            );
            Outcome::Dropped
        }
    }

    fn discard(&self, topic: &str, reason: &PublishError) -> Outcome {
        self.metrics.message_discarded();
        warn!(
            topic,
            outcome = %Outcome::Discarded,
            reason = %reason,
            "Message discarded"
        );
        Outcome::Discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SubscriptionSet;
    use crate::testing::MockTransport;
    use serde_json::json;

    fn publisher(capacity: usize) -> Publisher {
        Publisher::new(
            Arc::new(Outbox::new(capacity)),
            Arc::new(MetricsCollector::new()),
        )
    }

    fn handle(transport: MockTransport) -> ConnectionHandle<MockTransport> {
        let handle =
            ConnectionHandle::new(1, "jetson-01", "localhost", 1883, SubscriptionSet::default(), transport);
        handle.set_ready(true);
        handle
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(Outcome::Sent.as_str(), "sent");
        assert_eq!(Outcome::Dropped.to_string(), "dropped");
        assert_eq!(serde_json::to_value(Outcome::Enqueued).unwrap(), json!("enqueued"));
    }

    #[tokio::test]
    async fn test_sent_when_connected() {
        let publisher = publisher(4);
        let handle = handle(MockTransport::connected());

        let outcome = publisher
            .publish(Some(&handle), "alerts", json!({"n": 1}), true)
            .await;

        assert_eq!(outcome, Outcome::Sent);
        assert!(publisher.outbox().is_empty());
        assert_eq!(handle.transport().published(), vec![("alerts".to_string(), json!({"n": 1}))]);
        assert_eq!(publisher.metrics().get_metrics().publish.sent, 1);
    }

    #[tokio::test]
    async fn test_no_handle_enqueues_then_drops() {
        let publisher = publisher(1);

        let first = publisher
            .publish::<MockTransport>(None, "alerts", json!(1), true)
            .await;
        let second = publisher
            .publish::<MockTransport>(None, "alerts", json!(2), true)
            .await;

        assert_eq!(first, Outcome::Enqueued);
        assert_eq!(second, Outcome::Dropped);
        assert_eq!(publisher.outbox().snapshot(), vec![QueuedMessage::new("alerts", json!(1))]);
    }

    #[tokio::test]
    async fn test_no_handle_without_enqueue_discards() {
        let publisher = publisher(4);
        let outcome = publisher
            .publish::<MockTransport>(None, "hello", json!({}), false)
            .await;
        assert_eq!(outcome, Outcome::Discarded);
        assert!(publisher.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_topic_is_never_queued() {
        let publisher = publisher(4);
        let handle = handle(MockTransport::connected());

        assert_eq!(
            publisher.publish(Some(&handle), "alerts/#", json!(1), true).await,
            Outcome::Discarded
        );
        assert_eq!(
            publisher.publish::<MockTransport>(None, "", json!(1), true).await,
            Outcome::Discarded
        );
        assert!(publisher.outbox().is_empty());
        assert!(handle.transport().published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_drains_backlog_first() {
        let publisher = publisher(4);
        publisher.outbox().enqueue(QueuedMessage::new("stats", json!(1)));
        publisher.outbox().enqueue(QueuedMessage::new("stats", json!(2)));

        let handle = handle(MockTransport::connected());
        let outcome = publisher.publish(Some(&handle), "stats", json!(3), true).await;

        assert_eq!(outcome, Outcome::Sent);
        let payloads: Vec<Value> = handle
            .transport()
            .published()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let publisher = publisher(8);
        for n in 1..=5 {
            publisher.outbox().enqueue(QueuedMessage::new("stats", json!(n)));
        }

        let transport = MockTransport::connected();
        transport.fail_after(2);
        let handle = handle(transport);

        assert!(!publisher.drain(&handle).await);
        let remaining: Vec<Value> = publisher
            .outbox()
            .snapshot()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(remaining, vec![json!(3), json!(4), json!(5)]);

        let metrics = publisher.metrics().get_metrics();
        assert_eq!(metrics.outbox.drains_interrupted, 1);
        assert_eq!(metrics.outbox.drained_messages, 2);
    }

    #[tokio::test]
    async fn test_drained_messages_log_sent_outcome() {
        use std::io;
        use std::sync::Mutex as StdMutex;

        #[derive(Clone, Default)]
        struct Captured(Arc<StdMutex<Vec<u8>>>);

        impl io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let publisher = publisher(4);
        publisher.outbox().enqueue(QueuedMessage::new("stats", json!(1)));
        publisher.outbox().enqueue(QueuedMessage::new("alerts", json!(2)));
        assert!(publisher.drain(&handle(MockTransport::connected())).await);

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let sent: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("Queued message sent"))
            .collect();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("topic=stats") && sent[0].contains("outcome=sent"));
        assert!(sent[1].contains("topic=alerts") && sent[1].contains("outcome=sent"));
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_new_message_behind_backlog() {
        let publisher = publisher(4);
        publisher.outbox().enqueue(QueuedMessage::new("stats", json!("old")));

        // Only the drain's send fails; the transport would take the new one
        let transport = MockTransport::connected();
        transport.fail_next(1);
        let handle = handle(transport);

        let outcome = publisher.publish(Some(&handle), "alerts", json!("new"), true).await;

        assert_eq!(outcome, Outcome::Enqueued);
        assert!(handle.transport().published().is_empty());
        assert_eq!(
            publisher.outbox().snapshot(),
            vec![
                QueuedMessage::new("stats", json!("old")),
                QueuedMessage::new("alerts", json!("new")),
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_empty_outbox_is_success() {
        let publisher = publisher(2);
        let handle = handle(MockTransport::new());
        assert!(publisher.drain(&handle).await);
    }

    #[tokio::test]
    async fn test_publish_json_serializes() {
        #[derive(Serialize)]
        struct Ping {
            seq: u32,
        }

        let publisher = publisher(2);
        let handle = handle(MockTransport::connected());
        let outcome = publisher
            .publish_json(Some(&handle), "stats", &Ping { seq: 7 }, true)
            .await;

        assert_eq!(outcome, Outcome::Sent);
        assert_eq!(handle.transport().published()[0].1, json!({"seq": 7}));
    }
}
