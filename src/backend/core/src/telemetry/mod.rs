//! Telemetry: logging and metrics.
//!
//! - **Logging**: structured JSON/pretty logging through `tracing-subscriber`
//! - **Metrics**: Prometheus recorder for broker, scheduler and error series
//!
//! # Example
//!
//! ```rust,no_run
//! use laplink_core::config::ObservabilityConfig;
//! use laplink_core::telemetry::init_telemetry;
//!
//! let handle = init_telemetry(&ObservabilityConfig::default()).expect("Failed to initialize telemetry");
//! println!("{}", handle.metrics.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsRegistry};

use crate::config::ObservabilityConfig;

/// Service name attached to every metric.
pub const SERVICE_NAME: &str = "laplink-core";

/// Handle for the installed telemetry stack.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

/// Initialize metrics, then logging. Call once at startup.
pub fn init_telemetry(config: &ObservabilityConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(config, SERVICE_NAME)?;
    init_logging(&LoggingConfig::from_observability(config)?, &config.environment)?;

    Ok(TelemetryHandle { metrics })
}
