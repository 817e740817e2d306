//! Connection link errors.

use thiserror::Error;

/// Errors from [`ConnectionLink`](crate::link::ConnectionLink) operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link is not in the `Connected` state.
    #[error("not connected")]
    NotConnected,
    /// The transport handshake did not finish in time.
    #[error("connection timed out after {0}ms")]
    ConnectTimeout(u64),
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The server port could not be resolved.
    #[error("port lookup failed: {0}")]
    Port(String),
    /// A frame could not be serialized.
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The session writer is gone.
    #[error("outbound channel closed")]
    ChannelClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
