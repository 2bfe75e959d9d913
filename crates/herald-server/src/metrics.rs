//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const MESSAGES_TOTAL: &str = "herald_messages_total";
    pub const MESSAGES_BYTES: &str = "herald_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "herald_channels_active";
    pub const PUSH_LATENCY_SECONDS: &str = "herald_push_latency_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of subscriber connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of attached subscriber connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of pushes by result");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total payload bytes pushed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channels");
    metrics::describe_histogram!(
        names::PUSH_LATENCY_SECONDS,
        "Time to persist and enqueue one push, in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Install the Prometheus recorder and serve it on `host:port`.
///
/// # Errors
///
/// Returns an error if the address is invalid or the exporter cannot bind.
pub fn start_metrics_server(host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Record a new subscriber connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a subscriber disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a push and how it ended (`ok` or an error kind).
pub fn record_push(bytes: usize, result: &'static str, seconds: f64) {
    counter!(names::MESSAGES_TOTAL, "result" => result).increment(1);
    if result == "ok" {
        counter!(names::MESSAGES_BYTES).increment(bytes as u64);
    }
    histogram!(names::PUSH_LATENCY_SECONDS).record(seconds);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
