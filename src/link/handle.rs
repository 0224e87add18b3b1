//! The single live broker connection and the subscriptions it carries

use crate::config::SubscriptionEntry;
use crate::error::PublishError;
use crate::transport::{QosLevel, Transport};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// One topic filter re-applied on every successful connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub filter: String,
    pub qos: QosLevel,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QosLevel) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

impl From<&SubscriptionEntry> for Subscription {
    fn from(entry: &SubscriptionEntry) -> Self {
        Self::new(entry.filter.clone(), entry.qos)
    }
}

/// Ordered subscription filters bound at connect time
///
/// Immutable once built. A disconnect never clears it, so the next successful
/// connect re-subscribes identically without the caller redeclaring anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionSet(Vec<Subscription>);

impl SubscriptionSet {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self(subscriptions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn filters(&self) -> Vec<&str> {
        self.0.iter().map(|s| s.filter.as_str()).collect()
    }
}

impl From<Vec<Subscription>> for SubscriptionSet {
    fn from(subscriptions: Vec<Subscription>) -> Self {
        Self(subscriptions)
    }
}

impl From<&[SubscriptionEntry]> for SubscriptionSet {
    fn from(entries: &[SubscriptionEntry]) -> Self {
        Self(entries.iter().map(Subscription::from).collect())
    }
}

/// A broker connection as seen by producers
///
/// Identity and subscriptions are fixed at creation. A reconnect builds a new
/// handle with a higher generation and the manager swaps it in wholesale.
///
/// A handle starts out not ready. Producers can only send through it after
/// the lifecycle manager has applied an accepted connect and re-subscribed;
/// until then sends fail with [`PublishError::NotConnected`] even if the
/// transport already sees a live session.
pub struct ConnectionHandle<T: Transport> {
    generation: u64,
    client_id: String,
    host: String,
    port: u16,
    subscriptions: SubscriptionSet,
    transport: T,
    ready: AtomicBool,
}

impl<T: Transport> ConnectionHandle<T> {
    pub fn new(
        generation: u64,
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        subscriptions: SubscriptionSet,
        transport: T,
    ) -> Self {
        Self {
            generation,
            client_id: client_id.into(),
            host: host.into(),
            port,
            subscriptions,
            transport,
            ready: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the broker this handle targets
    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open or close the handle for producer traffic
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Ready and the transport session is up
    pub fn is_connected(&self) -> bool {
        self.is_ready() && self.transport.is_connected()
    }

    /// Encode `payload` as UTF-8 JSON and hand it to the transport
    pub async fn send(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        let bytes = serde_json::to_vec(payload)?;

        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        self.transport
            .publish(topic, bytes)
            .await
            .map_err(PublishError::transport)
    }

    /// Request every subscription in order. Returns the filters that failed.
    pub async fn resubscribe(&self) -> Vec<(String, T::Error)> {
        let mut failures = Vec::new();
        for subscription in self.subscriptions.iter() {
            if let Err(e) = self
                .transport
                .subscribe(&subscription.filter, subscription.qos)
                .await
            {
                failures.push((subscription.filter.clone(), e));
            }
        }
        failures
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("client_id", &self.client_id)
            .field("broker", &self.broker())
            .field("subscriptions", &self.subscriptions.filters())
            .field("ready", &self.is_ready())
            .field("connected", &self.is_connected())
            .finish()
    }
}
