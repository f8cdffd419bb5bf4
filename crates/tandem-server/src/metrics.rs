//! Metrics collection and export for Tandem.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const MESSAGES_TOTAL: &str = "tandem_messages_total";
    pub const MESSAGES_BYTES: &str = "tandem_messages_bytes";
    pub const TOPICS_ACTIVE: &str = "tandem_topics_active";
    pub const DOCUMENTS_ACTIVE: &str = "tandem_documents_active";
    pub const MERGES_TOTAL: &str = "tandem_merges_total";
    pub const POLLS_TOTAL: &str = "tandem_polls_total";
    pub const REJECTED_TOTAL: &str = "tandem_rejected_sessions_total";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
}

/// Gateway label values.
pub mod gateway {
    pub const SIGNALING: &str = "signaling";
    pub const LIVE: &str = "live";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of signaling topics");
    metrics::describe_gauge!(names::DOCUMENTS_ACTIVE, "Current number of live documents");
    metrics::describe_counter!(names::MERGES_TOTAL, "Total number of merged updates");
    metrics::describe_counter!(names::POLLS_TOTAL, "Total number of poll requests");
    metrics::describe_counter!(
        names::REJECTED_TOTAL,
        "Total number of rejected live sessions"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a message.
pub fn record_message(gateway: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "gateway" => gateway, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "gateway" => gateway, "direction" => direction)
        .increment(bytes as u64);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Update active document count.
pub fn set_active_documents(count: usize) {
    gauge!(names::DOCUMENTS_ACTIVE).set(count as f64);
}

/// Record a merged update.
pub fn record_merge(source: &'static str) {
    counter!(names::MERGES_TOTAL, "source" => source).increment(1);
}

/// Record a poll and what it did.
pub fn record_poll(outcome: &'static str) {
    counter!(names::POLLS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a rejected live session.
pub fn record_rejected(reason: &'static str) {
    counter!(names::REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    gateway: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection on `gateway`.
    #[must_use]
    pub fn new(gateway: &'static str) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "gateway" => gateway).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "gateway" => gateway).increment(1.0);
        Self { gateway }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "gateway" => self.gateway).decrement(1.0);
    }
}
