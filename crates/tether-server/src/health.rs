//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::bridge::BridgeStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` with a primary client, `"degraded"` without one.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connected controller clients.
    pub connections: usize,
    /// Current primary client.
    pub primary_client_id: Option<String>,
    /// Requests awaiting a response.
    pub pending_requests: usize,
    /// Windows with a recorded owner.
    pub owned_windows: usize,
}

/// Build a health response from live bridge stats.
pub fn health_check(start_time: Instant, stats: &BridgeStats) -> HealthResponse {
    let status = if stats.primary_client_id.is_some() {
        "ok"
    } else {
        "degraded"
    };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        primary_client_id: stats.primary_client_id.clone(),
        pending_requests: stats.pending_requests,
        owned_windows: stats.owned_windows,
    }
}
