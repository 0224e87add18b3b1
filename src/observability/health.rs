//! Health check HTTP server
//!
//! Exposes broker connectivity, outbox pressure and the metrics snapshot to
//! operators and to whatever supervises the device process.

use crate::observability::metrics::MetricsCollector;
use crate::outbox::Outbox;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    metrics: Arc<MetricsCollector>,
    outbox: Arc<Outbox>,
}

impl HealthServer {
    pub fn new(
        device_id: impl Into<String>,
        port: u16,
        metrics: Arc<MetricsCollector>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            port,
            metrics,
            outbox,
        }
    }

    /// All endpoints as one warp filter
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let metrics_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with individual checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status();
                let status_code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&status),
                    status_code,
                ))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
            let server = metrics_server.clone();
            async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.get_metrics())) }
        });

        // GET /ready - broker session is up
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.metrics.is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    status_code,
                ))
            }
        });

        // GET /live - process is responsive
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).and_then(|| async {
            let endpoints = HashMap::from([
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Publish, outbox and connection metrics"),
                ("/ready", "Readiness probe, OK while the broker session is up"),
                ("/live", "Liveness probe"),
            ]);
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse { endpoints }))
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self: Arc<Self>, shutdown: F) -> Result<(), warp::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let port = self.port;
        let (addr, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), shutdown)?;

        tracing::info!("Starting health server on {}", addr);
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }

    fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();

        let checks = HashMap::from([
            ("mqtt".to_string(), self.check_mqtt_health(now)),
            ("outbox".to_string(), self.check_outbox_health(now)),
        ]);

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        let status = if overall_healthy { "healthy" } else { "degraded" };

        HealthStatus {
            status: status.to_string(),
            timestamp: now,
            device_id: self.device_id.clone(),
            uptime_seconds: self.metrics.get_metrics().uptime_seconds,
            checks,
        }
    }

    fn check_mqtt_health(&self, now: u64) -> HealthCheck {
        if self.metrics.is_connected() {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("Broker session established".to_string()),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("No broker session, messages are being queued".to_string()),
                last_check: now,
            }
        }
    }

    fn check_outbox_health(&self, now: u64) -> HealthCheck {
        let depth = self.outbox.len();
        let capacity = self.outbox.capacity();

        if self.outbox.is_full() {
            HealthCheck {
                status: "saturated".to_string(),
                message: Some(format!(
                    "Outbox full ({depth}/{capacity}), new messages are dropped"
                )),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some(format!("{depth}/{capacity} messages queued")),
                last_check: now,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    device_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
