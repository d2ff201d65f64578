//! Prometheus metrics recorder.

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and describe the scheduler's
/// metric families. The admin API renders the handle on `/metrics`.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        "caravel_events_total",
        "Inbound master events by type"
    );
    describe_counter!(
        "caravel_master_calls_total",
        "Outbound master calls by type"
    );
    describe_counter!("caravel_offers_total", "Offers received");
    describe_counter!("caravel_launches_total", "Tasks launched");
    describe_counter!("caravel_acks_total", "Status updates acknowledged");
    describe_counter!(
        "caravel_reschedules_total",
        "Reschedule callbacks installed"
    );
    describe_counter!(
        "caravel_retries_exhausted_total",
        "Tasks failed for good after spending their retry budget"
    );
    describe_counter!(
        "caravel_revives_dropped_total",
        "REVIVE calls dropped by the rate limiter"
    );
    describe_counter!(
        "caravel_store_retries_total",
        "Store mutations retried after a transport failure"
    );
    describe_counter!("caravel_errors_total", "Errors surfaced, by category");

    Ok(handle)
}
