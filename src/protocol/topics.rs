//! Topic names and identifier validation for device messaging
//!
//! Topic names are opaque strings to the publish core. The constants below are
//! the deployment's channel convention, not a protocol constraint.

use thiserror::Error;

/// Device announcement, sent on every successful connect
pub const TOPIC_HELLO: &str = "hello";
/// Telemetry and statistics reports
pub const TOPIC_STATS: &str = "receive-from-jetson";
/// Alert notifications
pub const TOPIC_ALERTS: &str = "alerts";
/// Notices about recorded video files
pub const TOPIC_FILES: &str = "video-files";
/// Inbound command channel
pub const TOPIC_COMMANDS: &str = "commands";

/// All topics used by a device deployment
pub const DEVICE_TOPICS: [&str; 5] = [
    TOPIC_HELLO,
    TOPIC_STATS,
    TOPIC_ALERTS,
    TOPIC_FILES,
    TOPIC_COMMANDS,
];

/// Check that a topic can be published to.
///
/// Publishing requires a concrete topic name: no wildcards, no NUL, non-empty.
/// A message with an unpublishable topic would sit at the head of the outbox
/// forever, so it is rejected before it gets there.
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if let Some(ch) = topic.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
        return Err(ValidationError::InvalidTopicChar(ch));
    }
    Ok(())
}

/// Check a subscription filter: `+` must fill a whole level and `#` must be the
/// last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('\0') {
            return Err(ValidationError::InvalidTopicChar('\0'));
        }
        if level.contains('+') && *level != "+" {
            return Err(ValidationError::InvalidFilter(filter.to_string()));
        }
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(ValidationError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for topics and identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic contains invalid character: '{0}'")]
    InvalidTopicChar(char),
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),
}
