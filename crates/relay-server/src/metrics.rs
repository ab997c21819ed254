//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const RECORDS_TOTAL: &str = "relay_records_total";
    pub const RECORD_SECONDS: &str = "relay_record_seconds";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const PUBLISH_FAILURES_TOTAL: &str = "relay_publish_failures_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of socket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of socket connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Socket frames by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Socket bytes by direction");
    metrics::describe_counter!(names::RECORDS_TOTAL, "Broker records handled by topic and outcome");
    metrics::describe_histogram!(names::RECORD_SECONDS, "Broker record handling latency in seconds");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of peer sessions");
    metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Publishes that failed after all retries"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a socket frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a handled broker record.
pub fn record_record(topic: &str, outcome: &'static str, seconds: f64) {
    counter!(names::RECORDS_TOTAL, "topic" => topic.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!(names::RECORD_SECONDS, "topic" => topic.to_string()).record(seconds);
}

/// Record a publish that gave up.
pub fn record_publish_failure(topic: &str) {
    counter!(names::PUBLISH_FAILURES_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Sample the session count every `every` until cancelled.
pub fn spawn_session_sampler(
    registry: Arc<SessionRegistry>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => gauge!(names::SESSIONS_ACTIVE).set(registry.len() as f64),
            }
        }
    })
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
