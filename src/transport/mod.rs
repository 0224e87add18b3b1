//! Transport layer for broker communication
//!
//! The publish core never talks to a broker client directly. It sees a
//! [`Transport`] for sending and a stream of [`TransportEvent`]s describing what
//! the client's background event loop observed. [`Connector`] builds a transport
//! for one connection handle and wires its events into the given channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod mqtt;

/// Connect return code for an accepted connection
pub const CONNECT_ACCEPTED: u8 = 0;
/// Connect return code used when the broker could not be reached at all
pub const CONNECT_SERVER_UNAVAILABLE: u8 = 3;

/// Disconnect requested by this client
pub const DISCONNECT_REQUESTED: u8 = 0;
/// Broker closed the session
pub const DISCONNECT_BY_BROKER: u8 = 1;
/// Network failure or keep-alive timeout
pub const DISCONNECT_CONNECTION_LOST: u8 = 2;

/// Human readable meaning of an MQTT 3.1.1 connect return code
pub fn describe_connect_code(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

/// Human readable meaning of a disconnect code
pub fn describe_disconnect_code(code: u8) -> &'static str {
    match code {
        DISCONNECT_REQUESTED => "requested by client",
        DISCONNECT_BY_BROKER => "closed by broker",
        DISCONNECT_CONNECTION_LOST => "connection lost",
        _ => "unknown reason",
    }
}

/// Delivery guarantee requested for a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Message received on a subscribed filter
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// What the transport's event loop observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Connect acknowledgment; zero means accepted
    ConnectAck(u8),
    /// Established session ended
    Disconnect(u8),
    /// The transport is about to retry the connection
    Reconnecting { attempt: u32 },
    /// Publish received on a subscribed filter
    Message(InboundMessage),
}

/// Event tagged with the generation of the handle whose transport produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(generation: u64, kind: TransportEventKind) -> Self {
        Self { generation, kind }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Identity and target of one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub generation: u64,
}

/// Send side of a broker connection
///
/// Both operations return as soon as the broker client has accepted or refused
/// the request. `Ok` is the client's success status; it is not a delivery
/// acknowledgment.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Hand one encoded message to the broker client
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// Request a subscription on the live session
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), Self::Error>;

    /// Close the session and stop the background event loop
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Whether the session is currently established
    fn is_connected(&self) -> bool;
}

/// Builds a transport for a new connection handle
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Create the transport and start its event loop. Events for this handle
    /// must be tagged with `options.generation`.
    fn open(
        &self,
        options: &ConnectOptions,
        events: EventSender,
    ) -> Result<Self::Transport, <Self::Transport as Transport>::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversions() {
        for raw in 0u8..=2 {
            let qos = QosLevel::try_from(raw).unwrap();
            assert_eq!(u8::from(qos), raw);
        }
        assert!(QosLevel::try_from(3).is_err());
        assert_eq!(QosLevel::default(), QosLevel::AtMostOnce);
    }

    #[test]
    fn test_code_descriptions() {
        assert_eq!(describe_connect_code(CONNECT_ACCEPTED), "connection accepted");
        assert_eq!(
            describe_connect_code(CONNECT_SERVER_UNAVAILABLE),
            "server unavailable"
        );
        assert_eq!(describe_connect_code(42), "unknown return code");
        assert_eq!(
            describe_disconnect_code(DISCONNECT_CONNECTION_LOST),
            "connection lost"
        );
        assert_eq!(describe_disconnect_code(9), "unknown reason");
    }
}
