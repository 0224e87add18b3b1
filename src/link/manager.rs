//! Connection lifecycle manager
//!
//! Owns the single live [`ConnectionHandle`] and reacts to the transport
//! events that the handle's background event loop reports. It never runs
//! the broker event loop itself, and it never retries a refused connection:
//! retrying is left to the transport's own driver, which announces it with
//! `Reconnecting` events.

use super::handle::{ConnectionHandle, SubscriptionSet};
use super::state::ConnectionState;
use crate::error::{LinkError, LinkResult, PublishError};
use crate::observability::MetricsCollector;
use crate::protocol::{validate_device_id, validate_topic_filter};
use crate::publisher::{Outcome, Publisher};
use crate::transport::{
    describe_connect_code, describe_disconnect_code, ConnectOptions, Connector, EventReceiver,
    EventSender, InboundMessage, Transport, TransportEvent, TransportEventKind,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Called after every accepted connect, once subscriptions were re-applied
/// and before the outbox drain.
#[async_trait]
pub trait ConnectHook<T: Transport>: Send + Sync {
    async fn on_connect(&self, handle: &Arc<ConnectionHandle<T>>);
}

struct ActiveLink<T: Transport> {
    handle: Arc<ConnectionHandle<T>>,
    on_success: Option<Arc<dyn ConnectHook<T>>>,
}

impl<T: Transport> Clone for ActiveLink<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            on_success: self.on_success.clone(),
        }
    }
}

pub struct LinkManager<C: Connector> {
    connector: C,
    publisher: Arc<Publisher>,
    metrics: Arc<MetricsCollector>,
    active: RwLock<Option<ActiveLink<C::Transport>>>,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: EventSender,
    inbox: Option<mpsc::Sender<InboundMessage>>,
}

impl<C: Connector> LinkManager<C> {
    /// Create a manager and the receiving end of its transport event channel.
    /// Feed the receiver to [`LinkManager::run_events`] or hand events to
    /// [`LinkManager::handle_event`] one at a time.
    pub fn new(connector: C, publisher: Arc<Publisher>) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let metrics = publisher.metrics().clone();

        let manager = Self {
            connector,
            publisher,
            metrics,
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            state_tx,
            events_tx,
            inbox: None,
        };
        (manager, events_rx)
    }

    /// Forward messages received on subscribed filters to `inbox`
    pub fn with_inbox(mut self, inbox: mpsc::Sender<InboundMessage>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    fn read_active(&self) -> Option<ActiveLink<C::Transport>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_active(
        &self,
        next: Option<ActiveLink<C::Transport>>,
    ) -> Option<ActiveLink<C::Transport>> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, next)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Start a new connection and make its handle the current one.
    ///
    /// Only local failures are returned. An unreachable broker or a refused
    /// connection shows up later as a non-zero connect acknowledgment.
    pub async fn connect(
        &self,
        client_id: &str,
        host: &str,
        port: u16,
        subscriptions: SubscriptionSet,
        on_success: Option<Arc<dyn ConnectHook<C::Transport>>>,
    ) -> LinkResult<Arc<ConnectionHandle<C::Transport>>> {
        validate_device_id(client_id).map_err(LinkError::InvalidClientId)?;
        for subscription in subscriptions.iter() {
            validate_topic_filter(&subscription.filter).map_err(|source| {
                LinkError::InvalidSubscription {
                    filter: subscription.filter.clone(),
                    source,
                }
            })?;
        }

        let span = crate::link_span!(client_id = %client_id, generation = tracing::field::Empty);
        async {
            let (handle, previous) = self.install(client_id, host, port, subscriptions, on_success)?;
            tracing::Span::current().record("generation", handle.generation());
            self.metrics.connection_attempt();

            info!(
                broker = %handle.broker(),
                subscriptions = ?handle.subscriptions().filters(),
                "Connecting to MQTT broker"
            );

            if let Some(previous) = previous {
                info!(
                    previous_generation = previous.handle.generation(),
                    "Replacing previous connection handle"
                );
                if let Err(e) = previous.handle.transport().disconnect().await {
                    warn!("Failed to close previous connection: {}", e);
                }
            }

            Ok::<_, LinkError>(handle)
        }
        .instrument(span)
        .await
    }

    /// Open the transport and make its handle current in one critical
    /// section. Event processing reads the active handle through the same
    /// lock, so an acknowledgment from the new driver is applied only after
    /// the handle is installed and the state is `Connecting`. Generations are
    /// allocated under the lock too, so the installed handle is always the
    /// newest one.
    #[allow(clippy::type_complexity)]
    fn install(
        &self,
        client_id: &str,
        host: &str,
        port: u16,
        subscriptions: SubscriptionSet,
        on_success: Option<Arc<dyn ConnectHook<C::Transport>>>,
    ) -> LinkResult<(
        Arc<ConnectionHandle<C::Transport>>,
        Option<ActiveLink<C::Transport>>,
    )> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);

        let options = ConnectOptions {
            client_id: client_id.to_string(),
            host: host.to_string(),
            port,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let transport = self
            .connector
            .open(&options, self.events_tx.clone())
            .map_err(|e| LinkError::Transport(Box::new(e)))?;

        let handle = Arc::new(ConnectionHandle::new(
            options.generation,
            client_id,
            host,
            port,
            subscriptions,
            transport,
        ));

        self.set_state(ConnectionState::Connecting);
        let previous = active.replace(ActiveLink {
            handle: handle.clone(),
            on_success,
        });
        if let Some(previous) = &previous {
            previous.handle.set_ready(false);
        }
        Ok((handle, previous))
    }

    /// React to one transport event. Events tagged with a generation other
    /// than the current handle's are ignored.
    pub async fn handle_event(&self, event: TransportEvent) {
        let Some(active) = self.read_active() else {
            debug!(generation = event.generation, "Event ignored, no active connection");
            return;
        };
        if active.handle.generation() != event.generation {
            debug!(
                generation = event.generation,
                current = active.handle.generation(),
                "Event from a replaced connection ignored"
            );
            return;
        }

        let span = crate::link_span!(
            client_id = %active.handle.client_id(),
            generation = event.generation
        );
        self.apply(active, event.kind).instrument(span).await;
    }

    async fn apply(&self, active: ActiveLink<C::Transport>, kind: TransportEventKind) {
        let next = self.state().on_event(&kind);

        match kind {
            TransportEventKind::ConnectAck(code) if next.is_connected() => {
                self.metrics.connection_established();
                info!(code, broker = %active.handle.broker(), "Connected to MQTT broker");
                self.on_connected(&active, next).await;
            }
            TransportEventKind::ConnectAck(code) => {
                active.handle.set_ready(false);
                self.set_state(next);
                self.metrics.connection_failed();
                let failure = PublishError::ConnectFailure {
                    code,
                    reason: describe_connect_code(code),
                };
                error!(code, broker = %active.handle.broker(), "{}", failure);
            }
            TransportEventKind::Disconnect(code) => {
                active.handle.set_ready(false);
                self.set_state(next);
                self.metrics.connection_lost();
                warn!(
                    code,
                    reason = describe_disconnect_code(code),
                    queued = self.publisher.outbox().len(),
                    "Disconnected from MQTT broker"
                );
            }
            TransportEventKind::Reconnecting { attempt } => {
                active.handle.set_ready(false);
                self.set_state(next);
                self.metrics.reconnect_attempt();
                info!(attempt, "Transport retrying broker connection");
            }
            TransportEventKind::Message(message) => {
                self.metrics.message_received();
                self.deliver(message);
            }
        }
    }

    /// Resubscribe, open the handle, run the hook, then drain. The state only
    /// reads `Connected` once the handle accepts producer traffic.
    async fn on_connected(&self, active: &ActiveLink<C::Transport>, next: ConnectionState) {
        let handle = &active.handle;

        if !handle.subscriptions().is_empty() {
            info!(filters = ?handle.subscriptions().filters(), "Subscribing to topics");
        }
        for (filter, e) in handle.resubscribe().await {
            warn!(filter = %filter, "Subscription request failed: {}", e);
        }

        // Producers may send from here on; each publish drains the backlog
        // ahead of its own message.
        handle.set_ready(true);
        self.set_state(next);

        if let Some(hook) = &active.on_success {
            hook.on_connect(handle).await;
        }

        if !self.publisher.drain(handle).await {
            warn!(
                queued = self.publisher.outbox().len(),
                "Failed to send queued messages after connecting"
            );
        }
    }

    fn deliver(&self, message: InboundMessage) {
        let Some(inbox) = &self.inbox else {
            debug!(topic = %message.topic, "Inbound message ignored, no inbox");
            return;
        };

        let topic = message.topic.clone();
        match inbox.try_send(message) {
            Ok(()) => debug!(topic = %topic, "Inbound message forwarded"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %topic, "Inbox full, inbound message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(topic = %topic, "Inbox closed, inbound message dropped");
            }
        }
    }

    /// Process events until shutdown is signalled
    pub async fn run_events(&self, mut events: EventReceiver, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping event processing");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
    }

    /// Publish through the current handle, or the outbox when there is none
    pub async fn publish(&self, topic: &str, payload: Value, enqueue_on_failure: bool) -> Outcome {
        let handle = self.current();
        self.publisher
            .publish(handle.as_deref(), topic, payload, enqueue_on_failure)
            .await
    }

    /// Close the current connection. Queued messages stay in the outbox.
    pub async fn disconnect(&self) {
        let Some(active) = self.replace_active(None) else {
            return;
        };
        active.handle.set_ready(false);

        let was_connected = self.state().is_connected();
        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.metrics.connection_lost();
        }

        if let Err(e) = active.handle.transport().disconnect().await {
            warn!("Error while disconnecting from broker: {}", e);
        }
        info!(
            client_id = %active.handle.client_id(),
            queued = self.publisher.outbox().len(),
            "Disconnected from MQTT broker"
        );
    }

    /// The handle producers should publish through, if any
    pub fn current(&self) -> Option<Arc<ConnectionHandle<C::Transport>>> {
        self.read_active().map(|active| active.handle)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Subscription;
    use crate::outbox::Outbox;
    use crate::testing::{MockConnector, MockTransport};
    use crate::transport::QosLevel;
    use serde_json::json;

    fn manager(capacity: usize) -> (LinkManager<MockConnector>, MockConnector, EventReceiver) {
        let connector = MockConnector::new();
        let publisher = Arc::new(Publisher::new(
            Arc::new(Outbox::new(capacity)),
            Arc::new(MetricsCollector::new()),
        ));
        let (manager, events) = LinkManager::new(connector.clone(), publisher);
        (manager, connector, events)
    }

    fn commands() -> SubscriptionSet {
        SubscriptionSet::new(vec![Subscription::new("commands", QosLevel::ExactlyOnce)])
    }

    #[tokio::test]
    async fn test_connect_moves_to_connecting() {
        let (manager, connector, _events) = manager(4);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current().is_none());

        let handle = manager
            .connect("jetson-01", "10.0.0.2", 1883, commands(), None)
            .await
            .unwrap();

        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(handle.generation(), 1);
        assert_eq!(connector.open_count(), 1);
        assert_eq!(connector.last_options().unwrap().host, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_connect_validates_inputs() {
        let (manager, connector, _events) = manager(4);

        let result = manager
            .connect("bad id", "localhost", 1883, SubscriptionSet::default(), None)
            .await;
        assert!(matches!(result, Err(LinkError::InvalidClientId(_))));

        let bad_filter = SubscriptionSet::new(vec![Subscription::new("a/#/b", QosLevel::AtMostOnce)]);
        let result = manager
            .connect("jetson-01", "localhost", 1883, bad_filter, None)
            .await;
        assert!(matches!(result, Err(LinkError::InvalidSubscription { .. })));
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_connector_failure_is_reported() {
        let (manager, connector, _events) = manager(4);
        connector.set_fail_open(true);

        let result = manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await;
        assert!(matches!(result, Err(LinkError::Transport(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_accepted_ack_subscribes_and_drains() {
        let (manager, connector, mut events) = manager(4);
        manager.publish("alerts", json!(1), true).await;
        manager.publish("alerts", json!(2), true).await;

        manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await
            .unwrap();
        connector.acknowledge(0);
        manager.handle_event(events.recv().await.unwrap()).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        let transport = connector.last_transport().unwrap();
        assert_eq!(
            transport.subscriptions(),
            vec![("commands".to_string(), QosLevel::ExactlyOnce)]
        );
        assert_eq!(transport.published().len(), 2);
        assert!(manager.publisher().outbox().is_empty());
    }

    #[tokio::test]
    async fn test_refused_ack_disconnects_without_retry() {
        let (manager, connector, mut events) = manager(4);
        manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await
            .unwrap();

        connector.acknowledge(5);
        manager.handle_event(events.recv().await.unwrap()).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.open_count(), 1);
        assert_eq!(
            manager.publisher().metrics().get_metrics().connection.connection_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (manager, connector, mut events) = manager(4);
        manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await
            .unwrap();
        let first = connector.last_transport().unwrap();
        manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await
            .unwrap();

        assert_eq!(first.disconnect_calls(), 1);

        manager
            .handle_event(TransportEvent::new(1, TransportEventKind::ConnectAck(0)))
            .await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        connector.acknowledge(0);
        manager.handle_event(events.recv().await.unwrap()).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.current().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_inbox() {
        let (manager, connector, mut events) = manager(4);
        let (inbox_tx, mut inbox_rx) = mpsc::channel(4);
        let manager = manager.with_inbox(inbox_tx);

        manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await
            .unwrap();
        connector.deliver("commands", br#"{"command":"restart"}"#);
        manager.handle_event(events.recv().await.unwrap()).await;

        let message = inbox_rx.recv().await.unwrap();
        assert_eq!(message.topic, "commands");
        assert_eq!(&message.payload[..], br#"{"command":"restart"}"#);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_outbox() {
        let (manager, connector, mut events) = manager(4);
        manager
            .connect("jetson-01", "localhost", 1883, commands(), None)
            .await
            .unwrap();
        connector.acknowledge(0);
        manager.handle_event(events.recv().await.unwrap()).await;

        let transport: MockTransport = connector.last_transport().unwrap();
        transport.set_connected(false);
        assert_eq!(manager.publish("alerts", json!(1), true).await, Outcome::Enqueued);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current().is_none());
        assert_eq!(manager.publisher().outbox().len(), 1);
        assert_eq!(transport.disconnect_calls(), 1);
    }
}
