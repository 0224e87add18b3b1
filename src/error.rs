//! Error types for the publish core
//!
//! Publish failures never escape to the caller: they are classified here, logged,
//! and folded into an [`Outcome`](crate::publisher::Outcome). `LinkError` covers
//! the few failures that happen before a connection handle exists.

use crate::protocol::ValidationError;
use thiserror::Error;

/// Why a single message was not sent
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not connected: no live broker connection")]
    NotConnected,

    #[error("Transport send failed: {0}")]
    TransportSendFailure(String),

    #[error("Outbox backlog not drained ({queued} messages still queued)")]
    BacklogPending { queued: usize },

    #[error("Outbox full ({capacity} messages), message dropped")]
    QueueFull { capacity: usize },

    #[error("Broker rejected connection with code {code} ({reason})")]
    ConnectFailure { code: u8, reason: &'static str },

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] ValidationError),
}

impl PublishError {
    /// Transport failures are recoverable by retrying from the outbox
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PublishError::NotConnected
                | PublishError::TransportSendFailure(_)
                | PublishError::BacklogPending { .. }
        )
    }

    /// Create transport send failure from any displayable transport error
    pub fn transport<E: std::fmt::Display>(error: E) -> Self {
        Self::TransportSendFailure(error.to_string())
    }
}

/// Failures while establishing a connection handle
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Invalid client id: {0}")]
    InvalidClientId(#[source] ValidationError),

    #[error("Invalid subscription filter '{filter}': {source}")]
    InvalidSubscription {
        filter: String,
        #[source]
        source: ValidationError,
    },

    #[error("Transport setup failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

pub type LinkResult<T> = Result<T, LinkError>;
