//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_settings::ServerSettings;

/// Runtime configuration for the bridge server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// WebSocket endpoint path.
    pub path: String,
    /// Default response timeout for [`execute_action`](crate::ControllerBridge::execute_action).
    pub request_timeout_ms: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Whether a `focused` event from a standby client makes it primary.
    pub focus_claims_primary: bool,
    /// Capacity of each connection's outbound channel.
    pub outbound_buffer: usize,
}

impl ServerConfig {
    /// Default request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/controller".into(),
            request_timeout_ms: 30_000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            focus_claims_primary: true,
            outbound_buffer: 1024,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            path: settings.path.clone(),
            request_timeout_ms: settings.request_timeout_ms,
            max_message_size: settings.max_message_size,
            focus_claims_primary: settings.focus_claims_primary,
            ..Self::default()
        }
    }
}
