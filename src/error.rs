//! Error Model
//!
//! Every boundary operation of the client and server returns a [`NetError`]
//! by value (or hands one to a callback). The set of kinds is closed.

use std::fmt;
use std::io;

/// Closed set of failure kinds surfaced by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidAddress,
    ConnectionFailed,
    ServerUnavailable,
    SendFailed,
    ReceiveFailed,
    NotConnected,
    PortInUse,
    DisconnectionFailed,
    NotImplemented,
    Timeout,
    InternalError,
}

impl ErrorKind {
    /// Human readable description of the kind
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAddress => "Invalid address",
            ErrorKind::ConnectionFailed => "Connection failed",
            ErrorKind::ServerUnavailable => "Server is unavailable",
            ErrorKind::SendFailed => "Send failed",
            ErrorKind::ReceiveFailed => "Receive failed",
            ErrorKind::NotConnected => "Not connected",
            ErrorKind::PortInUse => "Port is already in use",
            ErrorKind::DisconnectionFailed => "Disconnection failed",
            ErrorKind::NotImplemented => "Not implemented",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InternalError => "Internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Error value returned at every client/server boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NetError {
    kind: ErrorKind,
    message: String,
}

/// Result type of boundary operations
pub type NetResult<T> = std::result::Result<T, NetError>;

impl NetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Map a failed connect attempt
    pub fn from_connect(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::ServerUnavailable,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::ConnectionFailed,
        };
        Self::new(kind, err.to_string())
    }

    /// Map a failed bind/listen
    pub fn from_bind(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::AddrInUse => ErrorKind::PortInUse,
            _ => ErrorKind::ConnectionFailed,
        };
        Self::new(kind, err.to_string())
    }

    pub fn from_send(err: &io::Error) -> Self {
        Self::new(ErrorKind::SendFailed, err.to_string())
    }

    pub fn from_receive(err: &io::Error) -> Self {
        Self::new(ErrorKind::ReceiveFailed, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(NetError::from_connect(&refused).kind(), ErrorKind::ServerUnavailable);

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(NetError::from_connect(&timed_out).kind(), ErrorKind::Timeout);

        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(NetError::from_connect(&other).kind(), ErrorKind::ConnectionFailed);
    }

    #[test]
    fn test_bind_error_mapping() {
        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        assert_eq!(NetError::from_bind(&in_use).kind(), ErrorKind::PortInUse);

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(NetError::from_bind(&denied).kind(), ErrorKind::ConnectionFailed);
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = NetError::not_connected("no live connection with id 7");
        assert_eq!(err.to_string(), "Not connected: no live connection with id 7");
        assert_eq!(err.message(), "no live connection with id 7");
    }
}
