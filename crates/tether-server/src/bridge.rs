//! `ControllerBridge`: the server-side facade over registry and router.
//!
//! Sessions feed it connects, disconnects and raw frames; callers use
//! [`ControllerBridge::send_request`] / [`ControllerBridge::execute_action`]
//! to run an action on whichever client should handle it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tether_core::protocol::{ClientFrame, ControlMessage, window_id_of};
use tether_core::{BridgeError, ClientId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::metrics::{BRIDGE_PRIMARY_CHANGES_TOTAL, BRIDGE_PROTOCOL_ERRORS_TOTAL};
use crate::registry::ConnectionRegistry;
use crate::router::RequestRouter;

/// Snapshot of bridge state for health and diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Connected controller clients.
    pub connections: usize,
    /// Current primary client.
    pub primary_client_id: Option<String>,
    /// Requests awaiting a response.
    pub pending_requests: usize,
    /// Windows with a recorded owner.
    pub owned_windows: usize,
}

/// Routes action requests to connected controller clients.
pub struct ControllerBridge {
    registry: ConnectionRegistry,
    router: RequestRouter,
    request_timeout: Duration,
    closing: AtomicBool,
    /// Cancelled by [`close`](Self::close); sessions stop on it.
    closed: CancellationToken,
}

impl ControllerBridge {
    /// Create a bridge with no connected clients.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.focus_claims_primary),
            router: RequestRouter::new(),
            request_timeout: config.request_timeout(),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Admit a newly connected client.
    pub fn on_connect(&self, connection: Arc<ClientConnection>) -> ClientId {
        let id = self.registry.register_client(connection);
        if self.registry.is_primary(&id) {
            counter!(BRIDGE_PRIMARY_CHANGES_TOTAL, "reason" => "first_connect").increment(1);
        }
        id
    }

    /// Remove a client and reject everything routed through it.
    pub fn on_disconnect(&self, client_id: &ClientId) {
        let outcome = self.registry.handle_disconnect(client_id);
        if !outcome.was_registered {
            return;
        }
        let err = if outcome.was_primary {
            BridgeError::PrimaryClosed
        } else {
            BridgeError::ConnectionClosed
        };
        let _ = self.router.fail_client(client_id, &err);
        if let Some(promoted) = outcome.promoted {
            counter!(BRIDGE_PRIMARY_CHANGES_TOTAL, "reason" => "promotion").increment(1);
            info!(client_id = %promoted, "standby promoted to primary");
        } else if outcome.was_primary {
            warn!("primary disconnected with no standby available");
        }
    }

    /// Handle one text frame from `client_id`.
    ///
    /// Malformed frames are logged and dropped; they never close the link.
    pub fn handle_message(&self, client_id: &ClientId, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                counter!(BRIDGE_PROTOCOL_ERRORS_TOTAL).increment(1);
                warn!(client_id = %client_id, error = %err, "dropping malformed frame");
                return;
            }
        };

        match frame {
            ClientFrame::Response(response) => {
                let _ = self.router.handle_response(response);
            }
            ClientFrame::Control(ControlMessage::Ping) => {
                if let Some(connection) = self.registry.get(client_id) {
                    if !connection.send_json(&ControlMessage::Pong) {
                        debug!(client_id = %client_id, "pong not queued");
                    }
                }
            }
            ClientFrame::Control(ControlMessage::Pong) => {}
            ClientFrame::Control(ControlMessage::RegisterWindows { window_ids }) => {
                self.registry.handle_register_windows(client_id, &window_ids);
            }
            ClientFrame::Control(ControlMessage::WindowCreated { window_id }) => {
                self.registry.handle_window_created(client_id, window_id);
            }
            ClientFrame::Control(ControlMessage::WindowRemoved { window_id }) => {
                let _ = self.registry.handle_window_removed(client_id, window_id);
            }
            ClientFrame::Control(ControlMessage::Focused { window_id }) => {
                if self.registry.handle_focus(client_id, window_id) {
                    counter!(BRIDGE_PRIMARY_CHANGES_TOTAL, "reason" => "focus").increment(1);
                }
            }
        }
    }

    /// Run `action` on the owner of `payload.windowId`, else on the primary.
    pub async fn send_request(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(BridgeError::Shutdown);
        }
        let target = self.registry.route_for(window_id_of(&payload))?;
        self.router.send_request(&target, action, payload, timeout).await
    }

    /// [`send_request`](Self::send_request) with the configured default timeout.
    pub async fn execute_action(&self, action: &str, payload: Value) -> Result<Value, BridgeError> {
        self.send_request(action, payload, self.request_timeout).await
    }

    /// Whether a primary client is connected.
    pub fn is_connected(&self) -> bool {
        self.registry.primary().is_some()
    }

    /// Read access to the registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Current state snapshot.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            connections: self.registry.connection_count(),
            primary_client_id: self.registry.primary().map(ClientId::into_inner),
            pending_requests: self.router.pending_count(),
            owned_windows: self.registry.owned_window_count(),
        }
    }

    /// Token cancelled once the bridge closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Reject every pending request and drop all connections.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let rejected = self.router.fail_all(&BridgeError::Shutdown);
        let dropped = self.registry.clear();
        self.closed.cancel();
        info!(rejected, dropped, "controller bridge closed");
    }
}
