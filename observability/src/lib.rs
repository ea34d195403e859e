//! # Observability
//!
//! Metric names emitted by the sync engine, helpers that keep the job
//! gauges and counters consistent across queues, and the Prometheus recorder
//! rendered by the metrics endpoint.

pub mod names;
pub mod telemetry;

pub use metrics_exporter_prometheus::PrometheusHandle;
pub use telemetry::{JobLabels, JobQueueKind, SyncTelemetry};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Installs the global Prometheus recorder and returns the handle used to
/// render the text payload. Call once per process.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    names::describe_all();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}
