//! Prometheus metrics for the broker, the job scheduler and errors.
//!
//! Metrics are emitted with the `metrics` facade wherever the work happens;
//! this module installs the Prometheus recorder and describes the series.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::ObservabilityConfig;

/// Buckets for connection queue waits, in seconds.
const QUEUE_WAIT_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0];

/// Handle to the installed recorder.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
pub fn init_metrics(config: &ObservabilityConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.metrics_enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", service_name)
        .add_global_label("environment", &config.environment)
        .set_buckets(QUEUE_WAIT_BUCKETS)?
        .install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_gauge!(
        "laplink_broker_outstanding",
        "Connections currently handed out by the broker"
    );
    describe_gauge!(
        "laplink_broker_available",
        "Connections not currently handed out"
    );
    describe_histogram!(
        "laplink_broker_queue_wait_seconds",
        Unit::Seconds,
        "Time a ticket waited before being granted a connection"
    );
    describe_counter!(
        "laplink_broker_timeouts_total",
        "Acquire requests that exhausted their wait budget"
    );

    describe_counter!(
        "laplink_job_ticks_total",
        "Phase job ticks by outcome"
    );
    describe_counter!(
        "laplink_job_retirements_total",
        "Phase jobs retired after a stall"
    );

    describe_counter!("laplink_errors_total", "Errors by code, category and severity");
}
