//! Metrics collection for ChatFleet
//!
//! This module provides Prometheus metrics for observability.
//! Worker metrics track admission and streaming; controller metrics track
//! registry membership and dispatch decisions.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ChatFleet
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub worker: WorkerMetrics,
    pub controller: ControllerMetrics,
}

/// Worker-specific metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Generation calls received
    pub requests_total: IntCounter,

    /// Calls that ended with an error frame
    pub requests_failed: IntCounter,

    /// Calls dropped by the client before the terminal frame
    pub requests_aborted: IntCounter,

    /// Calls holding an admission slot
    pub active_requests: IntGauge,

    /// Calls waiting for an admission slot
    pub waiting_requests: IntGauge,

    /// Time spent waiting at the admission gate
    pub admission_wait: Histogram,

    /// Duration from admission to terminal frame
    pub request_duration: Histogram,

    /// Frames written to streaming responses
    pub frames_streamed: IntCounter,

    /// Heartbeats the controller did not acknowledge
    pub heartbeat_failures: IntCounter,
}

/// Controller-specific metrics
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    /// Workers currently in the registry
    pub registered_workers: IntGauge,

    /// Heartbeats accepted
    pub heartbeats_received: IntCounter,

    /// Workers removed by the expiry sweep
    pub workers_expired: IntCounter,

    /// Workers removed after a failed status probe
    pub probe_failures: IntCounter,

    /// Dispatch queries answered with an address
    pub dispatch_decisions: IntCounter,

    /// Dispatch queries with no candidate
    pub no_worker_available: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let worker = WorkerMetrics {
            requests_total: counter(
                &registry,
                "worker_generate_requests_total",
                "Total number of generation requests",
            ),
            requests_failed: counter(
                &registry,
                "worker_generate_requests_failed_total",
                "Generation requests that ended with an error frame",
            ),
            requests_aborted: counter(
                &registry,
                "worker_generate_requests_aborted_total",
                "Generation requests abandoned by the client",
            ),
            active_requests: gauge(
                &registry,
                "worker_active_requests",
                "Requests currently holding an admission slot",
            ),
            waiting_requests: gauge(
                &registry,
                "worker_waiting_requests",
                "Requests waiting for an admission slot",
            ),
            admission_wait: histogram(
                &registry,
                "worker_admission_wait_seconds",
                "Time spent waiting at the admission gate",
                vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0],
            ),
            request_duration: histogram(
                &registry,
                "worker_request_duration_seconds",
                "Generation duration from admission to terminal frame",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            ),
            frames_streamed: counter(
                &registry,
                "worker_frames_streamed_total",
                "Frames written to streaming responses",
            ),
            heartbeat_failures: counter(
                &registry,
                "worker_heartbeat_failures_total",
                "Heartbeats that failed to reach the controller",
            ),
        };

        let controller = ControllerMetrics {
            registered_workers: gauge(
                &registry,
                "controller_registered_workers",
                "Workers currently in the registry",
            ),
            heartbeats_received: counter(
                &registry,
                "controller_heartbeats_received_total",
                "Heartbeats accepted from known workers",
            ),
            workers_expired: counter(
                &registry,
                "controller_workers_expired_total",
                "Workers removed after their heartbeat lapsed",
            ),
            probe_failures: counter(
                &registry,
                "controller_probe_failures_total",
                "Workers removed after a failed status probe",
            ),
            dispatch_decisions: counter(
                &registry,
                "controller_dispatch_decisions_total",
                "Dispatch queries answered with a worker address",
            ),
            no_worker_available: counter(
                &registry,
                "controller_no_worker_available_total",
                "Dispatch queries with no live candidate",
            ),
        };

        MetricsRegistry {
            registry,
            worker,
            controller,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Route serving `METRICS` in the Prometheus text format at `GET /metrics`
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(metrics_endpoint))
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        METRICS.gather(),
    )
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
