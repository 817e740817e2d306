//! # tether-core
//!
//! Shared vocabulary for the tether controller bridge:
//!
//! - **Branded IDs**: [`ClientId`](ids::ClientId) and [`RequestId`](ids::RequestId) newtypes
//! - **Wire protocol**: control frames, action requests, and action responses
//! - **Errors**: [`BridgeError`](errors::BridgeError) covering connection, routing,
//!   timeout, capacity, protocol, and remote action failures
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{BridgeError, ErrorKind};
pub use ids::{ClientId, RequestId};
pub use protocol::WindowId;
