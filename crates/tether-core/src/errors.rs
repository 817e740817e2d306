//! Error taxonomy for the controller bridge.
//!
//! [`BridgeError`] is what callers of the bridge see when a request does not
//! produce a result. Each variant belongs to one [`ErrorKind`], which lets a
//! caller tell backpressure (retry later) apart from a dead connection or a
//! genuine action failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Coarse classification of a [`BridgeError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure or loss of the connection carrying the request.
    Connection,
    /// No connected client can take the request.
    Routing,
    /// The response did not arrive in time.
    Timeout,
    /// Admission queue is full.
    Capacity,
    /// A malformed frame.
    Protocol,
    /// The remote action ran and reported failure.
    Action,
}

/// Errors surfaced to callers of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No primary client is connected.
    #[error("controller not connected")]
    NotConnected,

    /// The connection carrying the request closed before it was answered.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The primary connection closed while the request was outstanding.
    #[error("Primary connection closed")]
    PrimaryClosed,

    /// The bridge is shutting down.
    #[error("controller bridge closing")]
    Shutdown,

    /// Writing the request to the connection failed.
    #[error("failed to send request: {0}")]
    Send(String),

    /// No response within the request timeout.
    #[error("Request {action} timed out after {timeout_ms}ms")]
    Timeout {
        /// Action that was requested.
        action: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The admission queue is full.
    #[error("Controller overloaded. Queue full ({queue_size} requests). Server should slow down.")]
    Capacity {
        /// Configured queue bound.
        queue_size: usize,
    },

    /// A malformed frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote action reported failure.
    #[error("{0}")]
    Action(String),
}

impl BridgeError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionClosed | Self::PrimaryClosed | Self::Shutdown | Self::Send(_) => {
                ErrorKind::Connection
            }
            Self::NotConnected => ErrorKind::Routing,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Action(_) => ErrorKind::Action,
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Shutdown => false,
            _ => matches!(
                self.kind(),
                ErrorKind::Capacity | ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Routing
            ),
        }
    }

    /// Build the error for a failed remote action, defaulting the message.
    pub fn action(message: Option<String>) -> Self {
        Self::Action(message.unwrap_or_else(|| "Unknown error".to_owned()))
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
