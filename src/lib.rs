//! netbridge Library
//!
//! Uniform client and server connection handling over TCP and UDP, in an
//! event-loop or a blocking execution model.
//!
//! The client side is [`ClientSession`]: one logical outbound connection
//! with a sync/async send-receive contract and automatic reconnect with
//! exponential backoff. The server side is [`ServerListener`]: accept loop,
//! connection registry, per-connection dispatch to user callbacks and
//! graceful shutdown.

pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use client::{ClientSession, SessionState};
pub use config::{Address, ClientConfig, Config, ExecutionModel, Protocol, ReconnectConfig, ServerConfig};
pub use error::{ErrorKind, NetError, NetResult};
pub use server::{ConnectionId, ConnectionInfo, ListenerStats, ServerCallbacks, ServerListener, ServerSender};
pub use shutdown::ShutdownCoordinator;

/// Result type for configuration and binary plumbing
pub type Result<T> = anyhow::Result<T>;
