//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase with the `metrics` crate's
//! macros; this module installs the Prometheus exporter and registers
//! human-readable descriptions.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works
/// in that case; the macros route to whichever recorder won.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("flexllama_requests_total", "Total API requests by endpoint");
    describe_counter!(
        "flexllama_retries_total",
        "Preflight retries while a model was still loading"
    );
    describe_counter!(
        "flexllama_swaps_total",
        "Model swaps (a loaded model replaced by a process restart)"
    );
    describe_counter!(
        "flexllama_load_failures_total",
        "Model loads that left a runner in the failed state"
    );
    describe_counter!(
        "flexllama_auto_unloads_total",
        "Idle runners stopped by the auto-unload timer"
    );
    describe_gauge!("flexllama_in_flight", "Current in-flight requests per runner");
    describe_histogram!(
        "flexllama_load_duration_seconds",
        "Wall-clock time from swap start to runner ready"
    );
}
