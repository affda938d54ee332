//! Prometheus metrics
//!
//! Installs the global recorder once at startup; the session and
//! transport crates record through the `metrics` macros and everything
//! lands on the `/metrics` scrape endpoint. When the recorder is not
//! installed (disabled by config, or a second install attempt) those
//! macros are no-ops.

use axum::http::StatusCode;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Returns false when the recorder
/// could not be installed; the server still runs, without metrics.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return true;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
            true
        }
        Err(error) => {
            tracing::warn!(%error, "Failed to install Prometheus recorder, metrics disabled");
            false
        }
    }
}

/// `GET /metrics` in Prometheus exposition format.
pub async fn metrics_handler() -> (StatusCode, String) {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, String::new()),
    }
}
