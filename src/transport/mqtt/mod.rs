//! MQTT 3.1.1 transport built on `rumqttc`
//!
//! # Architecture
//!
//! - [`connection`] - Pure option building, error types and code mapping
//! - [`message_handler`] - Pure routing of broker client events
//! - [`retry`] - Pure reconnection decisions
//! - [`driver`] - Background event loop task per connection handle
//! - [`client`] - Impure send side and connector
//!
//! # Usage
//!
//! ```rust,no_run
//! use edgepub::config::MqttSection;
//! use edgepub::transport::mqtt::MqttConnector;
//! use edgepub::transport::{ConnectOptions, Connector};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let connector = MqttConnector::new(MqttSection::default());
//! let options = ConnectOptions {
//!     client_id: "jetson-01".to_string(),
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     generation: 1,
//! };
//! let _transport = connector.open(&options, events_tx)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub(crate) mod driver;
pub mod message_handler;
pub mod retry;

pub use client::{MqttConnector, MqttTransport};
pub use connection::{MqttError, ReconnectConfig};
pub use message_handler::{EventRoute, MessageHandler};
pub use retry::{ReconnectionDecision, RetryPolicy};
