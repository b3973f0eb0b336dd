//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Sessions currently connected (gauge).
pub const SESSIONS_ACTIVE: &str = "entangle_sessions_active";
/// Sessions force-closed after a failed send (counter).
pub const SESSIONS_FAILED_TOTAL: &str = "entangle_sessions_failed_total";
/// Mutation broadcasts fanned out to subscribers (counter).
pub const BROADCASTS_TOTAL: &str = "entangle_broadcasts_total";
/// Inbound requests (counter, labels: op).
pub const REQUESTS_TOTAL: &str = "entangle_requests_total";
/// Method calls dispatched (counter).
pub const CALLS_TOTAL: &str = "entangle_calls_total";
/// Method calls answered with `CallError` (counter).
pub const CALL_ERRORS_TOTAL: &str = "entangle_call_errors_total";
/// Method call duration seconds (histogram).
pub const CALL_DURATION_SECONDS: &str = "entangle_call_duration_seconds";
/// Client writes refused and resynced (counter).
pub const WRITES_REFUSED_TOTAL: &str = "entangle_writes_refused_total";
