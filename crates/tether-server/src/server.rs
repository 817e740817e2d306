//! `BridgeServer`: axum HTTP + WebSocket listener for controller clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::ClientId;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bridge::ControllerBridge;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::session::run_controller_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The bridge every session feeds.
    pub bridge: Arc<ControllerBridge>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// Per-connection outbound channel capacity.
    pub outbound_buffer: usize,
}

/// The bridge server.
pub struct BridgeServer {
    config: ServerConfig,
    bridge: Arc<ControllerBridge>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl BridgeServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let bridge = Arc::new(ControllerBridge::new(&config));
        Self {
            config,
            bridge,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            bridge: Arc::clone(&self.bridge),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            max_message_size: self.config.max_message_size,
            outbound_buffer: self.config.outbound_buffer,
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind the listener and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, path = %self.config.path, "bridge server listening");

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                error!(error = %err, "bridge server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// The bridge callers use to run actions.
    pub fn bridge(&self) -> &Arc<ControllerBridge> {
        &self.bridge
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET {path}: upgrade to a controller session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let client_id = ClientId::new();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            run_controller_session(
                socket,
                client_id,
                state.bridge,
                state.shutdown.token(),
                state.outbound_buffer,
            )
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.bridge.stats()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, crate::metrics::render(handle)),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> BridgeServer {
        BridgeServer::new(ServerConfig::default(), None)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_reports_degraded_without_clients() {
        let server = make_server();
        let (status, body) = get_body(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "degraded");
        assert_eq!(parsed["connections"], 0);
        assert!(parsed["primaryClientId"].is_null());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let (status, _) = get_body(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_is_ok() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = BridgeServer::new(ServerConfig::default(), Some(handle));
        let (status, _) = get_body(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn controller_path_requires_upgrade() {
        let server = make_server();
        let (status, _) = get_body(server.router(), "/controller").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_body(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }

    #[test]
    fn accessors() {
        let server = make_server();
        assert!(!server.shutdown().is_shutting_down());
        assert!(!server.bridge().is_connected());
        assert_eq!(server.config().path, "/controller");
    }
}
