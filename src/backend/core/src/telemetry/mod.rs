//! Telemetry: structured logging and Prometheus metrics.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::ObservabilityConfig;

/// Initialize logging and (when enabled) the metrics recorder. Returns
/// the handle the admin `/metrics` route renders from.
pub fn init(cfg: &ObservabilityConfig) -> anyhow::Result<Option<PrometheusHandle>> {
    init_logging(cfg)?;
    if cfg.metrics_enabled {
        Ok(Some(init_metrics()?))
    } else {
        Ok(None)
    }
}
