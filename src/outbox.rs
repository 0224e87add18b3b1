//! Bounded FIFO of messages that could not be delivered yet
//!
//! The outbox is the single shared mutable resource of the publish path. Every
//! operation takes a short critical section and returns immediately: a full
//! outbox refuses new messages instead of waiting for room.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of messages held while the broker is unreachable
pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;

/// A message waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Value,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Fixed-capacity FIFO of undelivered messages
///
/// Invariant: `len() <= capacity()` at all times. The head is the oldest
/// message and is always the first one retried.
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    queue: Mutex<VecDeque<QueuedMessage>>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    // Every mutation is a single VecDeque call, so a poisoned lock still
    // guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail. Returns false, without storing the message, when full.
    pub fn enqueue(&self, message: QueuedMessage) -> bool {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(message);
        true
    }

    /// Copy of the oldest message, leaving it in place
    pub fn peek(&self) -> Option<QueuedMessage> {
        self.lock().front().cloned()
    }

    /// Remove and return the oldest message
    pub fn pop(&self) -> Option<QueuedMessage> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued messages, oldest first
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.lock().iter().cloned().collect()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}
