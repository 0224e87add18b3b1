//! Impure I/O side of the MQTT transport
//!
//! `MqttConnector` creates one `rumqttc` client per connection handle and spawns
//! its event loop driver. `MqttTransport` is the send side handed to the
//! publish core.

use super::connection::{configure_mqtt_options, to_mqtt_qos, MqttError, ReconnectConfig};
use super::driver::{run_event_loop, DriverContext};
use crate::config::MqttSection;
use crate::transport::{ConnectOptions, Connector, EventSender, QosLevel, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Send side of one MQTT connection
pub struct MqttTransport {
    client_id: String,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Error = MqttError;

    /// QoS 0, not retained. Fails fast when the session is down or the
    /// client's request channel is full.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        self.client
            .try_subscribe(filter, to_mqtt_qos(qos))
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        debug!(target: "mqtt_transport", "Subscription requested: {}", filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        // Best effort: the session may already be gone
        if self.is_connected() {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to send MQTT disconnect: {}", e);
            }
        }

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("Event loop driver shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop driver ended with error: {}", e);
                }
                Err(_) => warn!("Event loop driver didn't shut down in time, aborting"),
                _ => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        // Can't await in Drop; abort the driver if disconnect() wasn't called
        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Builds `MqttTransport`s from the `[mqtt]` configuration section
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttSection,
    reconnect: ReconnectConfig,
}

impl MqttConnector {
    pub fn new(config: MqttSection) -> Self {
        let reconnect = ReconnectConfig::from(&config.reconnect);
        Self { config, reconnect }
    }
}

impl Connector for MqttConnector {
    type Transport = MqttTransport;

    fn open(&self, options: &ConnectOptions, events: EventSender) -> Result<MqttTransport, MqttError> {
        let mqtt_options = configure_mqtt_options(options, &self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.config.request_channel_capacity);

        let connected = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = DriverContext {
            generation: options.generation,
            events,
            connected: connected.clone(),
            reconnect: self.reconnect.clone(),
        };
        let handle = tokio::spawn(run_event_loop(event_loop, ctx, shutdown_rx));

        info!(
            client_id = %options.client_id,
            broker = %format!("{}:{}", options.host, options.port),
            generation = options.generation,
            "Opened MQTT transport"
        );

        Ok(MqttTransport {
            client_id: options.client_id.clone(),
            client,
            connected,
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectSection;
    use crate::transport::TransportEventKind;
    use tokio::sync::mpsc;

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "jetson-test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            generation: 1,
        }
    }

    #[tokio::test]
    async fn test_publish_fails_fast_before_connack() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = MqttConnector::new(MqttSection::default())
            .open(&options(), events_tx)
            .unwrap();

        assert!(!transport.is_connected());
        assert_eq!(transport.client_id(), "jetson-test");
        assert!(matches!(
            transport.publish("alerts", b"{}".to_vec()).await,
            Err(MqttError::NotConnected)
        ));
        assert!(matches!(
            transport.subscribe("commands", QosLevel::ExactlyOnce).await,
            Err(MqttError::NotConnected)
        ));

        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_spawns_driver_on_multi_thread_runtime() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let section = MqttSection {
            reconnect: ReconnectSection {
                max_attempts: Some(1),
                backoff_pattern_ms: vec![5],
                sustained_delay_ms: 5,
            },
            ..MqttSection::default()
        };

        let transport = MqttConnector::new(section)
            .open(&options(), events_tx)
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("driver reports the refused connect")
            .expect("channel open");
        assert_eq!(event.generation, 1);
        assert!(matches!(event.kind, TransportEventKind::ConnectAck(code) if code != 0));

        assert!(transport.disconnect().await.is_ok());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_address() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut bad = options();
        bad.host = String::new();
        let result = MqttConnector::new(MqttSection::default()).open(&bad, events_tx);
        assert!(matches!(result, Err(MqttError::InvalidBrokerAddress(_))));
    }
}
