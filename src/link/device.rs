//! Device-level messaging facade
//!
//! Wires configuration, the outbox, the publisher and the lifecycle manager
//! together for one device. When the broker address or the device name is
//! missing, messaging is disabled and every publish is a no-op returning
//! [`Outcome::Discarded`].

use super::handle::{ConnectionHandle, SubscriptionSet};
use super::manager::{ConnectHook, LinkManager};
use super::state::ConnectionState;
use crate::config::{DeviceConfig, MessagingSettings, ENV_BROKER_IP, ENV_DEVICE_NAME};
use crate::error::LinkResult;
use crate::observability::MetricsCollector;
use crate::outbox::Outbox;
use crate::protocol::{
    AlertMessage, HelloMessage, StatsReport, VideoFileNotice, TOPIC_ALERTS, TOPIC_FILES,
    TOPIC_HELLO, TOPIC_STATS,
};
use crate::publisher::{Outcome, Publisher};
use crate::transport::{Connector, EventReceiver, InboundMessage, Transport};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Announces the device on the hello topic after every accepted connect
pub struct HelloHook {
    publisher: Arc<Publisher>,
    hello: HelloMessage,
}

impl HelloHook {
    pub fn new(publisher: Arc<Publisher>, hello: HelloMessage) -> Self {
        Self { publisher, hello }
    }
}

#[async_trait]
impl<T: Transport> ConnectHook<T> for HelloHook {
    async fn on_connect(&self, handle: &Arc<ConnectionHandle<T>>) {
        // A hello that missed its session is meaningless later
        let outcome = self
            .publisher
            .publish_json(Some(&**handle), TOPIC_HELLO, &self.hello, false)
            .await;
        debug!(outcome = %outcome, "Hello published");
    }
}

/// Messaging for one device
pub struct DeviceLink<C: Connector> {
    settings: Option<MessagingSettings>,
    description: String,
    subscriptions: SubscriptionSet,
    manager: Arc<LinkManager<C>>,
    events: Mutex<Option<EventReceiver>>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<C: Connector> DeviceLink<C> {
    /// `settings` is `None` when messaging is disabled
    pub fn new(
        config: &DeviceConfig,
        settings: Option<MessagingSettings>,
        connector: C,
        inbox: Option<mpsc::Sender<InboundMessage>>,
    ) -> Self {
        let outbox = Arc::new(Outbox::new(config.outbox.capacity));
        let metrics = Arc::new(MetricsCollector::new());
        let publisher = Arc::new(Publisher::new(outbox, metrics));

        let (manager, events) = LinkManager::new(connector, publisher);
        let manager = match inbox {
            Some(inbox) => manager.with_inbox(inbox),
            None => manager,
        };
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            description: config.device.description.clone(),
            subscriptions: SubscriptionSet::from(config.mqtt.subscriptions.as_slice()),
            manager: Arc::new(manager),
            events: Mutex::new(Some(events)),
            pump: tokio::sync::Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    /// Device identity, when messaging is enabled
    pub fn device_id(&self) -> Option<&str> {
        self.settings.as_ref().map(|s| s.device_name.as_str())
    }

    /// Connect (or reconnect) to the configured broker.
    ///
    /// Returns `Ok(false)` without doing anything when messaging is disabled.
    /// The first call also starts processing transport events.
    pub async fn connect(&self) -> LinkResult<bool> {
        let Some(settings) = &self.settings else {
            warn!(
                "MQTT disabled: set {} and {} to enable messaging",
                ENV_BROKER_IP, ENV_DEVICE_NAME
            );
            return Ok(false);
        };

        self.start_event_pump().await;

        let hello = HelloMessage::new(settings.device_name.clone(), self.description.clone());
        let hook: Arc<dyn ConnectHook<C::Transport>> =
            Arc::new(HelloHook::new(self.manager.publisher().clone(), hello));

        self.manager
            .connect(
                &settings.device_name,
                &settings.broker_host,
                settings.broker_port,
                self.subscriptions.clone(),
                Some(hook),
            )
            .await?;
        Ok(true)
    }

    async fn start_event_pump(&self) {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return;
        }

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(events) = events {
            let manager = self.manager.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            *pump = Some(tokio::spawn(async move {
                manager.run_events(events, shutdown_rx).await;
            }));
        }
    }

    /// Publish a JSON payload; `Discarded` when messaging is disabled
    pub async fn publish(&self, topic: &str, payload: Value, enqueue_on_failure: bool) -> Outcome {
        if !self.is_enabled() {
            debug!(topic, "MQTT disabled, skipping message");
            return Outcome::Discarded;
        }
        self.manager.publish(topic, payload, enqueue_on_failure).await
    }

    /// Serialize and publish any message; `Discarded` when messaging is disabled
    pub async fn publish_message<S: Serialize>(
        &self,
        topic: &str,
        message: &S,
        enqueue_on_failure: bool,
    ) -> Outcome {
        if !self.is_enabled() {
            debug!(topic, "MQTT disabled, skipping message");
            return Outcome::Discarded;
        }
        let handle = self.manager.current();
        self.manager
            .publisher()
            .publish_json(handle.as_deref(), topic, message, enqueue_on_failure)
            .await
    }

    /// Telemetry report on the stats topic
    pub async fn send_stats(&self, stats: Value) -> Outcome {
        let Some(device_id) = self.device_id() else {
            return Outcome::Discarded;
        };
        let report = StatsReport::new(device_id, stats);
        self.publish_message(TOPIC_STATS, &report, true).await
    }

    pub async fn send_alert(&self, alert: &AlertMessage) -> Outcome {
        self.publish_message(TOPIC_ALERTS, alert, true).await
    }

    /// Announce a recorded video file
    pub async fn send_file_notice(&self, file_name: &str, url: Option<String>) -> Outcome {
        let Some(device_id) = self.device_id() else {
            return Outcome::Discarded;
        };
        let notice = VideoFileNotice {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            file_name: file_name.to_string(),
            url,
        };
        self.publish_message(TOPIC_FILES, &notice, true).await
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn manager(&self) -> &Arc<LinkManager<C>> {
        &self.manager
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        self.manager.publisher().outbox()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.manager.publisher().metrics()
    }

    /// Disconnect and stop processing events. Queued messages are kept.
    pub async fn shutdown(&self) {
        self.manager.disconnect().await;
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.pump.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(_) => debug!("Event processing stopped"),
                Err(_) => warn!("Event processing didn't stop in time"),
            }
        }
        info!(queued = self.outbox().len(), "Device link shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AlertSeverity;
    use crate::testing::MockConnector;
    use serde_json::json;

    fn settings() -> MessagingSettings {
        MessagingSettings {
            device_name: "jetson-01".to_string(),
            broker_host: "10.0.0.2".to_string(),
            broker_port: 1883,
        }
    }

    async fn wait_for_state(link: &DeviceLink<MockConnector>, wanted: ConnectionState) {
        let mut states = link.manager().subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == wanted))
            .await
            .expect("state change in time")
            .expect("state channel open");
    }

    #[tokio::test]
    async fn test_disabled_link_discards() {
        let connector = MockConnector::new();
        let link = DeviceLink::new(&DeviceConfig::default(), None, connector.clone(), None);

        assert!(!link.is_enabled());
        assert!(!link.connect().await.unwrap());
        assert_eq!(connector.open_count(), 0);
        assert_eq!(link.publish("alerts", json!(1), true).await, Outcome::Discarded);
        assert_eq!(link.send_stats(json!({})).await, Outcome::Discarded);
        assert!(link.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_hello_sent_on_every_connect() {
        let connector = MockConnector::new();
        let link = DeviceLink::new(&DeviceConfig::default(), Some(settings()), connector.clone(), None);

        assert!(link.connect().await.unwrap());
        connector.acknowledge(0);
        wait_for_state(&link, ConnectionState::Connected).await;

        let transport = connector.last_transport().unwrap();
        // The hook runs after the state flips, give it a moment
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.published().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (topic, payload) = &transport.published()[0];
        assert_eq!(topic, TOPIC_HELLO);
        assert_eq!(
            payload,
            &json!({"id": "jetson-01", "description": "MaskCam @ Jetson Nano"})
        );
        assert_eq!(
            transport.subscriptions(),
            vec![("commands".to_string(), crate::transport::QosLevel::ExactlyOnce)]
        );

        link.shutdown().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_typed_messages_are_queued_while_offline() {
        let connector = MockConnector::new();
        let link = DeviceLink::new(&DeviceConfig::default(), Some(settings()), connector, None);

        let alert = AlertMessage::new("jetson-01", AlertSeverity::Warning, "no mask detected");
        assert_eq!(link.send_alert(&alert).await, Outcome::Enqueued);
        assert_eq!(link.send_stats(json!({"people": 2})).await, Outcome::Enqueued);
        assert_eq!(
            link.send_file_notice("clip-0001.mp4", None).await,
            Outcome::Enqueued
        );

        let topics: Vec<String> = link.outbox().snapshot().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec![TOPIC_ALERTS, TOPIC_STATS, TOPIC_FILES]);
    }
}
