//! edgepub - resilient MQTT publishing for edge devices
//!
//! A small publish core for devices that talk to an MQTT broker over an
//! unreliable link. Producers publish JSON payloads at any time; what cannot be
//! sent right now is kept in a bounded outbox and delivered in order after the
//! next successful connect.
//!
//! # Overview
//!
//! - [`outbox`] - Bounded FIFO of undelivered messages
//! - [`publisher`] - Publish attempts, outbox draining and the send gate
//! - [`link`] - Connection lifecycle driven by transport events
//! - [`transport`] - Transport abstraction and the `rumqttc` implementation
//! - [`protocol`] - Topic names and device message payloads
//! - [`config`] - TOML and environment configuration
//! - [`observability`] - Logging, metrics and health endpoints
//!
//! # Quick Start
//!
//! ```rust
//! use edgepub::outbox::Outbox;
//! use edgepub::observability::MetricsCollector;
//! use edgepub::publisher::{Outcome, Publisher};
//! use edgepub::testing::MockTransport;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let publisher = Publisher::new(Arc::new(Outbox::new(100)), Arc::new(MetricsCollector::new()));
//!
//! // No connection yet: the message waits in the outbox
//! let outcome = publisher
//!     .publish::<MockTransport>(None, "alerts", json!({"people": 3}), true)
//!     .await;
//! assert_eq!(outcome, Outcome::Enqueued);
//! assert_eq!(publisher.outbox().len(), 1);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod observability;
pub mod outbox;
pub mod protocol;
pub mod publisher;
pub mod testing;
pub mod transport;

pub use config::{DeviceConfig, MessagingSettings};
pub use error::{LinkError, LinkResult, PublishError};
pub use link::{ConnectHook, ConnectionHandle, ConnectionState, DeviceLink, LinkManager};
pub use outbox::{Outbox, QueuedMessage};
pub use publisher::{Outcome, Publisher};
pub use transport::mqtt::{MqttConnector, MqttTransport};
pub use transport::{Connector, Transport, TransportEvent, TransportEventKind};
