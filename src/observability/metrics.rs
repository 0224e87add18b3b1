//! Thread-safe metrics collection for the publish path
//!
//! Atomic counters per publish outcome, drain results and connection events,
//! plus a bounded window of drain durations for latency percentiles. One
//! collector is shared (via `Arc`) by the publisher, the link manager and the
//! health server.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_DRAIN_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Publish outcomes
    messages_sent: AtomicU64,
    messages_enqueued: AtomicU64,
    messages_dropped: AtomicU64,
    messages_discarded: AtomicU64,
    messages_received: AtomicU64,

    // Outbox
    drains_completed: AtomicU64,
    drains_interrupted: AtomicU64,
    drained_messages: AtomicU64,
    outbox_depth: AtomicU64,
    outbox_high_water_mark: AtomicU64,
    drain_times: Mutex<Vec<u64>>, // milliseconds

    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
    connection_start_time: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_discarded: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            drains_completed: AtomicU64::new(0),
            drains_interrupted: AtomicU64::new(0),
            drained_messages: AtomicU64::new(0),
            outbox_depth: AtomicU64::new(0),
            outbox_high_water_mark: AtomicU64::new(0),
            drain_times: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Publish outcomes
    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_discarded(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Outbox metrics
    pub fn outbox_depth_changed(&self, depth: usize) {
        let depth = depth as u64;
        self.outbox_depth.store(depth, Ordering::Relaxed);
        self.outbox_high_water_mark
            .fetch_max(depth, Ordering::Relaxed);
    }

    /// Record one drain pass; `sent` counts messages delivered from the outbox
    pub fn drain_finished(&self, emptied: bool, sent: usize, duration: Duration) {
        if emptied {
            self.drains_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.drains_interrupted.fetch_add(1, Ordering::Relaxed);
        }
        self.drained_messages
            .fetch_add(sent as u64, Ordering::Relaxed);
        self.record_drain_time(duration);
    }

    fn record_drain_time(&self, duration: Duration) {
        if let Ok(mut times) = self.drain_times.lock() {
            times.push(duration.as_millis() as u64);

            // Limit to the most recent samples
            if times.len() > MAX_DRAIN_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Calculate drain duration statistics (pure function over a sample copy)
    fn calculate_drain_time_statistics(&self) -> (f64, f64, f64) {
        let mut times = match self.drain_times.lock() {
            Ok(times) => times.clone(),
            Err(_) => return (0.0, 0.0, 0.0),
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        times.sort_unstable();
        let avg = times.iter().sum::<u64>() as f64 / times.len() as f64;
        (avg, percentile(&times, 50.0), percentile(&times, 95.0))
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_drain_time_ms, drain_time_p50_ms, drain_time_p95_ms) =
            self.calculate_drain_time_statistics();

        MetricsSnapshot {
            publish: PublishMetrics {
                sent: self.messages_sent.load(Ordering::Relaxed),
                enqueued: self.messages_enqueued.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                discarded: self.messages_discarded.load(Ordering::Relaxed),
                received: self.messages_received.load(Ordering::Relaxed),
            },
            outbox: OutboxMetrics {
                depth: self.outbox_depth.load(Ordering::Relaxed),
                high_water_mark: self.outbox_high_water_mark.load(Ordering::Relaxed),
                drains_completed: self.drains_completed.load(Ordering::Relaxed),
                drains_interrupted: self.drains_interrupted.load(Ordering::Relaxed),
                drained_messages: self.drained_messages.load(Ordering::Relaxed),
                avg_drain_time_ms,
                drain_time_p50_ms,
                drain_time_p95_ms,
            },
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                disconnects: self.disconnects.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub publish: PublishMetrics,
    pub outbox: OutboxMetrics,
    pub connection: ConnectionMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub sent: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub discarded: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxMetrics {
    pub depth: u64,
    pub high_water_mark: u64,
    pub drains_completed: u64,
    pub drains_interrupted: u64,
    pub drained_messages: u64,
    pub avg_drain_time_ms: f64,
    pub drain_time_p50_ms: f64,
    pub drain_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u64,
    pub connection_duration_seconds: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
