//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "huddle_connections_rejected_total";
    pub const LINES_TOTAL: &str = "huddle_lines_total";
    pub const FRAMES_TOTAL: &str = "huddle_frames_total";
    pub const FRAMES_BYTES: &str = "huddle_frames_bytes";
    pub const COMMANDS_TOTAL: &str = "huddle_commands_total";
    pub const RPC_REQUESTS_TOTAL: &str = "huddle_rpc_requests_total";
    pub const RPC_LATENCY_SECONDS: &str = "huddle_rpc_latency_seconds";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
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
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the listener was at capacity"
    );
    metrics::describe_counter!(names::LINES_TOTAL, "Protocol lines read or written");
    metrics::describe_counter!(names::FRAMES_TOTAL, "WebSocket frames read or written");
    metrics::describe_counter!(names::FRAMES_BYTES, "Bytes of WebSocket frames");
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Line commands submitted by kind");
    metrics::describe_counter!(names::RPC_REQUESTS_TOTAL, "RPC requests by operation");
    metrics::describe_histogram!(
        names::RPC_LATENCY_SECONDS,
        "RPC request latency in seconds"
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
pub fn record_connection(listener: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "listener" => listener).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "listener" => listener).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection(listener: &'static str) {
    gauge!(names::CONNECTIONS_ACTIVE, "listener" => listener).decrement(1.0);
}

/// Record a refused connection.
pub fn record_rejected(listener: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "listener" => listener).increment(1);
}

/// Record a protocol line.
pub fn record_line(direction: &'static str) {
    counter!(names::LINES_TOTAL, "direction" => direction).increment(1);
}

/// Record a WebSocket frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a line command.
pub fn record_command(kind: &'static str) {
    counter!(names::COMMANDS_TOTAL, "kind" => kind).increment(1);
}

/// Record an RPC request and its latency.
pub fn record_rpc(operation: &'static str, seconds: f64) {
    counter!(names::RPC_REQUESTS_TOTAL, "operation" => operation).increment(1);
    histogram!(names::RPC_LATENCY_SECONDS, "operation" => operation).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    listener: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(listener: &'static str) -> Self {
        record_connection(listener);
        Self { listener }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let _guard = ConnectionMetricsGuard::new("line");
        record_rpc("connect", 0.001);
        record_error("websocket");
    }
}
