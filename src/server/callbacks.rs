//! Server callbacks

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::registry::ConnectionId;

pub type ReceiveCallback = Arc<dyn Fn(ConnectionId, SocketAddr, Bytes) + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn(ConnectionId, SocketAddr) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(ConnectionId, SocketAddr) + Send + Sync>;

/// User hooks invoked by the listener's dispatcher.
///
/// Callbacks run on the listener's worker thread and may call back into
/// the listener (`send`, `connections`, ...) through a [`super::ServerSender`].
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    pub(crate) on_receive: Option<ReceiveCallback>,
    pub(crate) on_connect: Option<ConnectCallback>,
    pub(crate) on_disconnect: Option<DisconnectCallback>,
}

impl ServerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_receive<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionId, SocketAddr, Bytes) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(callback));
        self
    }

    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionId, SocketAddr) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionId, SocketAddr) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ServerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallbacks")
            .field("on_receive", &self.on_receive.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}
