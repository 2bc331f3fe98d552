//! Server Module
//!
//! Listener, connection registry and per-connection dispatch.

pub mod callbacks;
pub mod dispatcher;
pub mod listener;
#[cfg(unix)]
pub mod poller;
pub mod registry;

pub use callbacks::ServerCallbacks;
pub use listener::{ListenerStats, ServerListener, ServerSender};
pub use registry::{ConnectionId, ConnectionInfo};
