//! Device configuration
//!
//! Settings come from an optional TOML file. The broker address and the device
//! identity are normally provided through `MQTT_BROKER_IP` and
//! `MQTT_DEVICE_NAME`; when either is missing from both the environment and the
//! file, messaging is disabled.

use crate::outbox::DEFAULT_OUTBOX_CAPACITY;
use crate::protocol::{
    validate_device_id, validate_topic_filter, DEFAULT_DEVICE_DESCRIPTION, TOPIC_COMMANDS,
};
use crate::transport::QosLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable holding the broker host
pub const ENV_BROKER_IP: &str = "MQTT_BROKER_IP";
/// Environment variable holding the device identity
pub const ENV_DEVICE_NAME: &str = "MQTT_DEVICE_NAME";

/// Default MQTT broker port
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Top level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub outbox: OutboxSection,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identity, overridden by `MQTT_DEVICE_NAME`
    pub name: Option<String>,
    /// Description announced in the hello message
    #[serde(default = "default_description")]
    pub description: String,
    /// Interval between telemetry reports in `run` mode (0 disables them)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            name: None,
            description: default_description(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_description() -> String {
    DEFAULT_DEVICE_DESCRIPTION.to_string()
}

fn default_stats_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker host, overridden by `MQTT_BROKER_IP`
    pub broker_host: Option<String>,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Capacity of the broker client's request channel
    #[serde(default = "default_request_capacity")]
    pub request_channel_capacity: usize,
    /// Filters re-applied after every successful connect
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_host: None,
            broker_port: default_broker_port(),
            keep_alive_secs: default_keep_alive(),
            username_env: None,
            password_env: None,
            request_channel_capacity: default_request_capacity(),
            subscriptions: default_subscriptions(),
            reconnect: ReconnectSection::default(),
        }
    }
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_keep_alive() -> u64 {
    60
}

fn default_request_capacity() -> usize {
    10
}

fn default_subscriptions() -> Vec<SubscriptionEntry> {
    vec![SubscriptionEntry {
        filter: TOPIC_COMMANDS.to_string(),
        qos: QosLevel::ExactlyOnce,
    }]
}

/// One `[[mqtt.subscriptions]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    pub filter: String,
    #[serde(default)]
    pub qos: QosLevel,
}

/// Transport-level retry schedule used by the MQTT event loop driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![500, 1000, 2000, 5000]
}

fn default_sustained_delay() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxSection {
    #[serde(default = "default_outbox_capacity")]
    pub capacity: usize,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            capacity: default_outbox_capacity(),
        }
    }
}

fn default_outbox_capacity() -> usize {
    DEFAULT_OUTBOX_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

/// Resolved broker target and identity. Present only when messaging is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagingSettings {
    pub device_name: String,
    pub broker_host: String,
    pub broker_port: u16,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device name: {0}")]
    InvalidDeviceName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, else from the first default location that
    /// exists, else fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let default_paths = ["edgepub.toml", "config/edgepub.toml"];
        match default_paths
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists())
        {
            Some(found) => Self::load_from_file(&found),
            None => Ok(Self::default()),
        }
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "outbox.capacity must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.request_channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_attempts must be greater than 0 or unset for unlimited"
                    .to_string(),
            ));
        }
        for entry in &self.mqtt.subscriptions {
            validate_topic_filter(&entry.filter).map_err(|e| {
                ConfigError::InvalidConfig(format!("subscription '{}': {e}", entry.filter))
            })?;
        }
        if let Some(name) = &self.device.name {
            validate_name(name)?;
        }
        Ok(())
    }

    /// Resolve messaging settings from the process environment
    pub fn messaging(&self) -> Result<Option<MessagingSettings>, ConfigError> {
        self.messaging_with(|key| std::env::var(key).ok())
    }

    /// Resolve messaging settings with a custom variable lookup.
    ///
    /// Returns `Ok(None)` when the broker host or the device name is missing.
    pub fn messaging_with<F>(&self, lookup: F) -> Result<Option<MessagingSettings>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let broker_host = non_empty(lookup(ENV_BROKER_IP)).or(non_empty(self.mqtt.broker_host.clone()));
        let device_name = non_empty(lookup(ENV_DEVICE_NAME)).or(non_empty(self.device.name.clone()));

        match (broker_host, device_name) {
            (Some(broker_host), Some(device_name)) => {
                validate_name(&device_name)?;
                Ok(Some(MessagingSettings {
                    device_name,
                    broker_host,
                    broker_port: self.mqtt.broker_port,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        get_env_var_optional(self.mqtt.password_env.as_ref())
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    validate_device_id(name)
        .map_err(|e| ConfigError::InvalidDeviceName(format!("'{name}': {e}")))
}
