//! Client Module
//!
//! Outbound sessions with automatic reconnect.

pub mod reconnect;
pub mod session;

pub use reconnect::ReconnectController;
pub use session::{ClientSession, SessionState};
