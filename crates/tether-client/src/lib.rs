//! # tether-client
//!
//! The client half of the controller bridge, run by each browser agent.
//!
//! - [`link::ConnectionLink`]: outbound WebSocket with heartbeat and reconnect
//! - [`limiter::AdmissionLimiter`]: bounded concurrency with a bounded FIFO queue
//! - [`tracker::RequestTracker`]: per-request lifecycle and health stats
//! - [`response_queue::ResponseDeliveryQueue`]: responses held while disconnected
//! - [`dispatch::ActionDispatchTable`]: action name to handler lookup
//! - [`validator::RequestValidator`]: duplicate-id rejection
//! - [`controller::AgentController`]: wires the above together

#![deny(unsafe_code)]

pub mod controller;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod limiter;
pub mod link;
pub mod port;
pub mod response_queue;
pub mod tracker;
pub mod validator;

pub use controller::{AgentController, ControllerConfig};
pub use dispatch::{ActionDispatchTable, ActionHandler};
pub use error::LinkError;
pub use link::{ConnectionLink, ConnectionStatus, LinkConfig};
pub use port::{PortProvider, StaticPort, StaticWindows, WindowProvider};
