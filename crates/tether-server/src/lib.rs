//! # tether-server
//!
//! The server half of the controller bridge.
//!
//! - [`registry::ConnectionRegistry`]: connected clients, primary election, window ownership
//! - [`router::RequestRouter`]: request/response correlation with per-request timeouts
//! - [`bridge::ControllerBridge`]: the facade callers use to run actions on a client
//! - [`server::BridgeServer`]: axum WebSocket endpoint plus `/health` and `/metrics`
//! - Graceful shutdown via [`shutdown::ShutdownCoordinator`]

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod connection;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;

pub use bridge::{BridgeStats, ControllerBridge};
pub use config::ServerConfig;
pub use server::BridgeServer;
