//! Connection lifecycle states and their pure transitions

use crate::transport::{TransportEventKind, CONNECT_ACCEPTED};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// State after observing a transport event (pure function)
    pub fn on_event(self, event: &TransportEventKind) -> ConnectionState {
        match event {
            TransportEventKind::ConnectAck(code) if *code == CONNECT_ACCEPTED => {
                ConnectionState::Connected
            }
            TransportEventKind::ConnectAck(_) | TransportEventKind::Disconnect(_) => {
                ConnectionState::Disconnected
            }
            TransportEventKind::Reconnecting { .. } => ConnectionState::Connecting,
            TransportEventKind::Message(_) => self,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundMessage;
    use bytes::Bytes;

    const ALL: [ConnectionState; 3] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
    ];

    #[test]
    fn test_accepted_ack_connects() {
        for state in ALL {
            assert_eq!(
                state.on_event(&TransportEventKind::ConnectAck(0)),
                ConnectionState::Connected
            );
        }
    }

    #[test]
    fn test_refused_ack_and_disconnect() {
        assert_eq!(
            ConnectionState::Connecting.on_event(&TransportEventKind::ConnectAck(5)),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::Connected.on_event(&TransportEventKind::Disconnect(2)),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_reconnecting_and_messages() {
        assert_eq!(
            ConnectionState::Disconnected.on_event(&TransportEventKind::Reconnecting { attempt: 1 }),
            ConnectionState::Connecting
        );

        let message = TransportEventKind::Message(InboundMessage {
            topic: "commands".to_string(),
            payload: Bytes::from_static(b"{}"),
        });
        for state in ALL {
            assert_eq!(state.on_event(&message), state);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::default().to_string(), "disconnected");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }
}
