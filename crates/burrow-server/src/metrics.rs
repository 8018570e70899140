//! Metrics collection and export for Burrow.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const PUBLISHED_TOTAL: &str = "burrow_published_total";
    pub const PUBLISHED_BYTES: &str = "burrow_published_bytes";
    pub const PUBLISH_ERRORS_TOTAL: &str = "burrow_publish_errors_total";
    pub const PROBES_TOTAL: &str = "burrow_probes_total";
    pub const PROBE_SECONDS: &str = "burrow_probe_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::PUBLISHED_TOTAL,
        "Total number of events published through the HTTP endpoint"
    );
    metrics::describe_counter!(names::PUBLISHED_BYTES, "Total payload bytes published");
    metrics::describe_counter!(
        names::PUBLISH_ERRORS_TOTAL,
        "Total number of failed publishes"
    );
    metrics::describe_counter!(names::PROBES_TOTAL, "Total number of liveness probes");
    metrics::describe_histogram!(
        names::PROBE_SECONDS,
        "Liveness probe round-trip time in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a published event.
pub fn record_publish(bytes: usize) {
    counter!(names::PUBLISHED_TOTAL).increment(1);
    counter!(names::PUBLISHED_BYTES).increment(bytes as u64);
}

/// Record a failed publish.
pub fn record_publish_error(kind: &'static str) {
    counter!(names::PUBLISH_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record a liveness probe outcome.
pub fn record_probe(rtt: Option<Duration>) {
    let outcome = if rtt.is_some() { "ok" } else { "failed" };
    counter!(names::PROBES_TOTAL, "outcome" => outcome).increment(1);
    if let Some(rtt) = rtt {
        histogram!(names::PROBE_SECONDS).record(rtt.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op
        init_metrics();
        record_publish(3);
        record_publish_error("protocol");
        record_probe(Some(Duration::from_millis(4)));
        record_probe(None);
    }
}
