//! Collaborators the client consults but does not own.

use async_trait::async_trait;
use tether_core::WindowId;

use crate::error::LinkError;

/// Resolves the server's listen port before each connection attempt.
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// The port to dial.
    async fn port(&self) -> Result<u16, LinkError>;
}

/// A fixed port.
#[derive(Clone, Copy, Debug)]
pub struct StaticPort(pub u16);

#[async_trait]
impl PortProvider for StaticPort {
    async fn port(&self) -> Result<u16, LinkError> {
        Ok(self.0)
    }
}

/// Reports the windows this client currently owns, so ownership can be
/// re-registered after every reconnect.
#[async_trait]
pub trait WindowProvider: Send + Sync {
    /// Ids of all open windows.
    async fn window_ids(&self) -> Vec<WindowId>;
}

/// A fixed window list.
#[derive(Clone, Debug, Default)]
pub struct StaticWindows(pub Vec<WindowId>);

#[async_trait]
impl WindowProvider for StaticWindows {
    async fn window_ids(&self) -> Vec<WindowId> {
        self.0.clone()
    }
}
