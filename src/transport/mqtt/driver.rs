//! Background event loop for one MQTT connection handle
//!
//! Polls the `rumqttc` event loop, forwards what it sees as transport events,
//! and retries failed connections on the configured backoff schedule until
//! shutdown is signalled.

use super::connection::ReconnectConfig;
use super::message_handler::{EventRoute, MessageHandler};
use super::retry::{ReconnectionDecision, RetryPolicy};
use crate::transport::{
    describe_connect_code, EventSender, TransportEvent, TransportEventKind, CONNECT_ACCEPTED,
};
use rumqttc::EventLoop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything the driver task needs besides the event loop itself
pub(crate) struct DriverContext {
    pub generation: u64,
    pub events: EventSender,
    pub connected: Arc<AtomicBool>,
    pub reconnect: ReconnectConfig,
}

impl DriverContext {
    /// Forward an event; false once nobody is listening anymore
    fn emit(&self, kind: TransportEventKind) -> bool {
        self.events
            .send(TransportEvent::new(self.generation, kind))
            .is_ok()
    }
}

/// Drive the event loop until shutdown, max retries, or the listener is gone
pub(crate) async fn run_event_loop(
    mut event_loop: EventLoop,
    ctx: DriverContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(generation = ctx.generation, "Starting MQTT event loop driver");
    let mut reconnect_attempts = 0u32;

    loop {
        let polled = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping event loop driver");
                    break;
                }
                continue;
            }
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(event) => {
                let route = MessageHandler::route_mqtt_event(&event);
                match &route {
                    EventRoute::ConnectionAcknowledged { code } if *code == CONNECT_ACCEPTED => {
                        reconnect_attempts = 0;
                        ctx.connected.store(true, Ordering::SeqCst);
                    }
                    EventRoute::Disconnected => {
                        ctx.connected.store(false, Ordering::SeqCst);
                    }
                    EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                        if *rejected > 0 {
                            warn!(packet_id, rejected, "Broker rejected subscription filters");
                        } else {
                            debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                        }
                    }
                    EventRoute::InfrastructureEvent(event_str) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                    }
                    _ => {}
                }

                if let Some(kind) = MessageHandler::to_transport_event(&route) {
                    if !ctx.emit(kind) {
                        break;
                    }
                }
            }
            Err(e) => {
                let was_connected = ctx.connected.swap(false, Ordering::SeqCst);
                let kind = MessageHandler::classify_poll_error(&e, was_connected);
                if let TransportEventKind::ConnectAck(code) = kind {
                    debug!(
                        target: "mqtt_transport",
                        code,
                        reason = describe_connect_code(code),
                        "Connection attempt failed: {}", e
                    );
                } else {
                    debug!(target: "mqtt_transport", "MQTT event loop error: {}", e);
                }
                if !ctx.emit(kind) {
                    break;
                }

                // Copy the flag out; a watch::Ref must not live across the sleep below
                let shutting_down = *shutdown_rx.borrow();
                match RetryPolicy::should_attempt_reconnection(
                    reconnect_attempts,
                    &ctx.reconnect,
                    shutting_down,
                ) {
                    ReconnectionDecision::Proceed { attempt, delay_ms } => {
                        reconnect_attempts = attempt;
                        if !ctx.emit(TransportEventKind::Reconnecting { attempt }) {
                            break;
                        }
                        if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                            break;
                        }
                    }
                    ReconnectionDecision::AbortShutdownRequested => break,
                    ReconnectionDecision::AbortMaxAttemptsExceeded => {
                        error!(
                            attempts = reconnect_attempts,
                            "Max reconnection attempts exceeded, giving up on broker"
                        );
                        break;
                    }
                }
            }
        }
    }

    ctx.connected.store(false, Ordering::SeqCst);
    info!(generation = ctx.generation, "MQTT event loop driver stopped");
}

/// Sleep unless shutdown is signalled first. Returns false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(shutdown_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!interruptible_sleep(shutdown_rx, 5_000).await);
    }

    fn assert_send<F: std::future::Future + Send>(_: &F) {}

    #[tokio::test]
    async fn test_driver_future_is_send() {
        use rumqttc::{AsyncClient, MqttOptions};
        use tokio::sync::mpsc;

        let (_client, event_loop) = AsyncClient::new(MqttOptions::new("send-check", "127.0.0.1", 1), 10);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = DriverContext {
            generation: 1,
            events: events_tx,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect: ReconnectConfig::default(),
        };

        // Spawned onto multi-thread runtimes by the connector
        let driver = run_event_loop(event_loop, ctx, shutdown_rx);
        assert_send(&driver);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_failed_connects() {
        use crate::transport::CONNECT_SERVER_UNAVAILABLE;
        use rumqttc::{AsyncClient, MqttOptions};
        use tokio::sync::mpsc;

        // Port 1 on loopback refuses connections immediately
        let options = MqttOptions::new("driver-test", "127.0.0.1", 1);
        let (_client, event_loop) = AsyncClient::new(options, 10);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = DriverContext {
            generation: 9,
            events: events_tx,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect: ReconnectConfig {
                max_attempts: Some(1),
                backoff_pattern: vec![1],
                sustained_delay: 1,
            },
        };
        let handle = tokio::spawn(run_event_loop(event_loop, ctx, shutdown_rx));

        let first = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("driver should report the failed connect")
            .expect("channel open");
        assert_eq!(first.generation, 9);
        assert_eq!(
            first.kind,
            TransportEventKind::ConnectAck(CONNECT_SERVER_UNAVAILABLE)
        );

        let second = events_rx.recv().await.expect("reconnecting event");
        assert_eq!(second.kind, TransportEventKind::Reconnecting { attempt: 1 });

        // Second failure exhausts the single allowed attempt and stops the driver
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        drop(shutdown_tx);
    }
}
