//! Pure routing of broker client events
//!
//! Turns raw `rumqttc` events and poll errors into routing decisions and
//! transport-neutral events for the connection manager.

use super::connection::connack_code;
use crate::transport::{
    InboundMessage, TransportEventKind, CONNECT_SERVER_UNAVAILABLE, DISCONNECT_BY_BROKER,
    DISCONNECT_CONNECTION_LOST,
};
use bytes::Bytes;
use rumqttc::{ConnectionError, Event, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the appropriate handling (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    code: connack_code(connack.code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify an event loop error (pure function).
    ///
    /// An error before the session was established is a failed connect; an
    /// error afterwards ends the session.
    pub fn classify_poll_error(error: &ConnectionError, session_established: bool) -> TransportEventKind {
        if session_established {
            return TransportEventKind::Disconnect(DISCONNECT_CONNECTION_LOST);
        }
        match error {
            ConnectionError::ConnectionRefused(code) => {
                TransportEventKind::ConnectAck(connack_code(*code))
            }
            _ => TransportEventKind::ConnectAck(CONNECT_SERVER_UNAVAILABLE),
        }
    }

    /// Transport event for an acknowledged route, if it maps to one
    pub fn to_transport_event(route: &EventRoute) -> Option<TransportEventKind> {
        match route {
            EventRoute::ConnectionAcknowledged { code } => {
                Some(TransportEventKind::ConnectAck(*code))
            }
            EventRoute::MessageReceived { topic, payload } => {
                Some(TransportEventKind::Message(InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                }))
            }
            EventRoute::Disconnected => Some(TransportEventKind::Disconnect(DISCONNECT_BY_BROKER)),
            EventRoute::SubscriptionConfirmed { .. }
            | EventRoute::InfrastructureEvent(_)
            | EventRoute::OutgoingEvent => None,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker answered the connect request
    ConnectionAcknowledged { code: u8 },
    /// Message received on a subscribed filter
    MessageReceived { topic: String, payload: Bytes },
    /// Broker closed the session
    Disconnected,
    /// Subscription acknowledged; `rejected` counts refused filters
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
