//! Pure connection configuration for the MQTT transport
//!
//! Builds `rumqttc` options from device configuration and maps between the
//! broker client's types and the transport-neutral ones.

use crate::config::{MqttSection, ReconnectSection};
use crate::transport::{ConnectOptions, QosLevel};
use rumqttc::{ConnectReturnCode, MqttOptions, QoS};
use std::time::Duration;
use thiserror::Error;

/// rumqttc rejects keep-alive intervals shorter than this
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Reconnection schedule for the event loop driver
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds (if empty, uses sustained delay)
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_pattern_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given 1-based attempt: walk the pattern, then
    /// sustain the last delay forever
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
}

/// Pure function to configure MQTT options for one connection handle
pub fn configure_mqtt_options(
    options: &ConnectOptions,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let host = options.host.trim();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(MqttError::InvalidBrokerAddress(options.host.clone()));
    }
    if options.port == 0 {
        return Err(MqttError::InvalidBrokerAddress(format!(
            "{}:{}",
            options.host, options.port
        )));
    }

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, options.port);
    mqtt_options.set_keep_alive(Duration::from_secs(
        config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    mqtt_options.set_clean_session(true);

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    Ok(mqtt_options)
}

/// Numeric MQTT 3.1.1 return code for a broker acknowledgment
pub fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}
