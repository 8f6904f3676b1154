//! Prometheus metrics

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder. Returns None (and keeps running)
/// if a recorder is already installed, e.g. in tests.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed");
            None
        }
    }
}

pub fn record_call_started() {
    metrics::counter!("callbridge_calls_total").increment(1);
    metrics::gauge!("callbridge_live_calls").increment(1.0);
}

pub fn record_call_ended(fatal: bool) {
    metrics::gauge!("callbridge_live_calls").decrement(1.0);
    if fatal {
        metrics::counter!("callbridge_calls_fatal_total").increment(1);
    }
}
