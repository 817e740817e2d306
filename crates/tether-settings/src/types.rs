//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Root settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Bridge server listener.
    pub server: ServerSettings,
    /// Client-side connection link.
    pub link: LinkSettings,
    /// Client-side admission control.
    pub concurrency: ConcurrencySettings,
    /// Client-side undelivered response buffer.
    pub response_queue: ResponseQueueSettings,
    /// Client-side request lifecycle bookkeeping.
    pub tracker: TrackerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Bridge server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// WebSocket endpoint path.
    pub path: String,
    /// Default per-request response timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Whether a `focused` event from a standby client makes it primary.
    pub focus_claims_primary: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9300,
            path: "/controller".to_string(),
            request_timeout_ms: 30_000,
            max_message_size: 16 * 1024 * 1024,
            focus_claims_primary: true,
        }
    }
}

/// Client connection link settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkSettings {
    /// Server host to dial.
    pub host: String,
    /// Server endpoint path.
    pub path: String,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_interval_ms: u64,
    /// Interval between heartbeat pings.
    pub heartbeat_interval_ms: u64,
    /// How long a single ping may go unanswered.
    pub heartbeat_timeout_ms: u64,
    /// Bound on the transport handshake.
    pub connection_timeout_ms: u64,
    /// Capacity of the outbound frame channel.
    pub outbound_buffer: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            path: "/controller".to_string(),
            reconnect_interval_ms: 5_000,
            heartbeat_interval_ms: 20_000,
            heartbeat_timeout_ms: 5_000,
            connection_timeout_ms: 10_000,
            outbound_buffer: 256,
        }
    }
}

/// Admission limiter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencySettings {
    /// Actions allowed to run at once.
    pub max_concurrent: usize,
    /// Actions allowed to wait for a slot.
    pub max_queue_size: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue_size: 1_000,
        }
    }
}

/// Response delivery queue settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseQueueSettings {
    /// Responses kept while disconnected; the oldest is dropped beyond this.
    pub max_size: usize,
}

impl Default for ResponseQueueSettings {
    fn default() -> Self {
        Self { max_size: 1_000 }
    }
}

/// Request lifecycle tracker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerSettings {
    /// How long a finished request stays visible in stats.
    pub retention_ms: u64,
    /// Period of the stale-entry sweep.
    pub sweep_interval_ms: u64,
    /// Age beyond which the sweep drops any entry.
    pub stale_after_ms: u64,
    /// Default threshold for hung-request diagnostics.
    pub hung_threshold_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            retention_ms: 60_000,
            sweep_interval_ms: 60_000,
            stale_after_ms: 300_000,
            hung_threshold_ms: 30_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
