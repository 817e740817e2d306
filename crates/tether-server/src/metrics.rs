//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Requests sent to controller clients (counter, labels: action).
pub const BRIDGE_REQUESTS_TOTAL: &str = "bridge_requests_total";
/// Requests that did not produce a result (counter, labels: kind).
pub const BRIDGE_REQUEST_ERRORS_TOTAL: &str = "bridge_request_errors_total";
/// Round-trip time of a request (histogram).
pub const BRIDGE_REQUEST_DURATION_SECONDS: &str = "bridge_request_duration_seconds";
/// Responses with no matching pending request (counter).
pub const BRIDGE_UNMATCHED_RESPONSES_TOTAL: &str = "bridge_unmatched_responses_total";
/// Malformed frames dropped (counter).
pub const BRIDGE_PROTOCOL_ERRORS_TOTAL: &str = "bridge_protocol_errors_total";
/// Primary designation changes (counter, labels: reason).
pub const BRIDGE_PRIMARY_CHANGES_TOTAL: &str = "bridge_primary_changes_total";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
