//! Device message payloads
//!
//! Every payload is serialized to UTF-8 JSON before it reaches the broker.
//! These types cover the messages a device produces on its own; callers may
//! also publish any `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description announced when none is configured
pub const DEFAULT_DEVICE_DESCRIPTION: &str = "MaskCam @ Jetson Nano";

/// Announcement published on the hello topic after every successful connect
///
/// # Examples
/// ```
/// use edgepub::protocol::HelloMessage;
///
/// let hello = HelloMessage::new("jetson-01", "MaskCam @ Jetson Nano");
/// let json = serde_json::to_value(&hello).unwrap();
/// assert_eq!(json["id"], "jetson-01");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloMessage {
    /// Device identity
    pub id: String,
    /// Human readable description of the device
    pub description: String,
}

impl HelloMessage {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// Periodic telemetry report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form statistics object
    pub stats: Value,
}

impl StatsReport {
    pub fn new(device_id: impl Into<String>, stats: Value) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            stats,
        }
    }
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Alert raised by the device or on its behalf by an external service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertMessage {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AlertMessage {
    pub fn new(
        device_id: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Notice that a video file was recorded and is available
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoFileNotice {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Command received on the command topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

impl DeviceCommand {
    /// Parse a command from a raw JSON payload
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(payload).map_err(|e| format!("Failed to parse DeviceCommand: {e}"))
    }
}
