//! Dispatcher
//!
//! Event-loop side of the server: the accept loop, one read loop per
//! accepted stream and the datagram receive loop. The registry and
//! callback plumbing in [`ServerContext`] is shared with the blocking
//! poller.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::callbacks::ServerCallbacks;
use super::listener::ListenerCore;
use super::registry::ConnectionId;
use crate::transport::{is_transient, PeerHandle, MAX_DATAGRAM_SIZE};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion) cannot spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Bound listening socket handed to a worker
pub(crate) enum BoundSocket {
    Stream(StdTcpListener),
    Datagram(Arc<StdUdpSocket>),
}

impl BoundSocket {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BoundSocket::Stream(listener) => listener.local_addr(),
            BoundSocket::Datagram(socket) => socket.local_addr(),
        }
    }
}

/// Everything a worker needs for one listen cycle
pub(crate) struct ServerContext {
    pub core: Arc<ListenerCore>,
    pub callbacks: ServerCallbacks,
    pub buffer_size: usize,
}

impl ServerContext {
    /// Register an accepted stream and announce it.
    ///
    /// `writer` goes into the registry for `send`; the caller keeps its own
    /// handle on the same socket for reading. Returns `None` once the
    /// listener is shutting down, in which case the caller drops the stream.
    pub fn register_stream(&self, remote: SocketAddr, writer: std::net::TcpStream) -> Option<ConnectionId> {
        if !self.core.is_running() {
            debug!("Refusing connection from {} during shutdown", remote);
            return None;
        }

        let id = self.core.registry.insert(remote, PeerHandle::stream(writer));
        if !self.emit_connect(id, remote) {
            // Shutdown won the race; an unannounced record must not get a disconnect.
            self.core.registry.remove(id);
            return None;
        }

        self.core.record_connection();
        debug!("Accepted connection {} from {}", id, remote);
        Some(id)
    }

    /// Fire on_connect; false when the listener is no longer running
    pub fn emit_connect(&self, id: ConnectionId, remote: SocketAddr) -> bool {
        if !self.core.is_running() {
            return false;
        }
        if let Some(on_connect) = &self.callbacks.on_connect {
            on_connect(id, remote);
        }
        true
    }

    pub fn emit_receive(&self, id: ConnectionId, remote: SocketAddr, data: Bytes) {
        self.core.record_received(data.len());
        if !self.core.is_running() {
            return;
        }
        if let Some(on_receive) = &self.callbacks.on_receive {
            on_receive(id, remote, data);
        }
    }

    /// Tear down one connection. Fires on_disconnect only if the record was still registered.
    pub fn close_connection(&self, id: ConnectionId) {
        let record = match self.core.registry.remove(id) {
            Some(record) => record,
            None => return,
        };

        if let Err(e) = record.handle.close() {
            debug!("Error closing connection {}: {}", id, e);
        }
        debug!("Connection {} from {} closed", id, record.remote);

        self.emit_disconnect(id, record.remote);
    }

    pub fn emit_disconnect(&self, id: ConnectionId, remote: SocketAddr) {
        if let Some(on_disconnect) = &self.callbacks.on_disconnect {
            on_disconnect(id, remote);
        }
    }

    /// Datagram from `remote`: resolve (or assign) its id and deliver
    pub fn dispatch_datagram(&self, socket: &Arc<StdUdpSocket>, remote: SocketAddr, data: Bytes) {
        let id = self.core.assign_datagram_peer(remote, socket);
        self.emit_receive(id, remote, data);
    }
}

/// Start the accept or receive loop for `socket` on `handle`
pub(crate) fn spawn(handle: &Handle, context: Arc<ServerContext>, socket: BoundSocket, stop: CancellationToken) {
    match socket {
        BoundSocket::Stream(listener) => {
            handle.spawn(accept_loop(context, listener, stop));
        }
        BoundSocket::Datagram(socket) => {
            handle.spawn(datagram_loop(context, socket, stop));
        }
    }
}

async fn accept_loop(context: Arc<ServerContext>, listener: StdTcpListener, stop: CancellationToken) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register listening socket: {}", e);
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                if let Err(e) = start_connection(&context, stream, remote, &stop) {
                    warn!("Dropping connection from {}: {}", remote, e);
                }
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop stopped");
}

fn start_connection(
    context: &Arc<ServerContext>,
    stream: TcpStream,
    remote: SocketAddr,
    stop: &CancellationToken,
) -> io::Result<()> {
    let stream = stream.into_std()?;
    let writer = stream.try_clone()?;
    let reader = TcpStream::from_std(stream)?;

    if let Some(id) = context.register_stream(remote, writer) {
        tokio::spawn(read_loop(Arc::clone(context), id, remote, reader, stop.clone()));
    }
    Ok(())
}

#[instrument(skip(context, stream, stop), fields(connection_id = id, remote = %remote))]
async fn read_loop(
    context: Arc<ServerContext>,
    id: ConnectionId,
    remote: SocketAddr,
    mut stream: TcpStream,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; context.buffer_size];

    loop {
        let read = tokio::select! {
            biased;
            // Shutdown tears the record down itself.
            _ = stop.cancelled() => return,
            read = stream.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("Peer closed the connection");
                break;
            }
            Ok(n) => context.emit_receive(id, remote, Bytes::copy_from_slice(&buf[..n])),
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                debug!("Read failed: {}", e);
                break;
            }
        }
    }

    context.close_connection(id);
}

#[instrument(skip_all, fields(local = ?socket.local_addr().ok()))]
async fn datagram_loop(context: Arc<ServerContext>, socket: Arc<StdUdpSocket>, stop: CancellationToken) {
    let receiver = match socket.try_clone().and_then(UdpSocket::from_std) {
        Ok(receiver) => receiver,
        Err(e) => {
            error!("Failed to register datagram socket: {}", e);
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = receiver.recv_from(&mut buf) => received,
        };

        match received {
            Ok((n, remote)) => {
                context.dispatch_datagram(&socket, remote, Bytes::copy_from_slice(&buf[..n]))
            }
            Err(e) if is_transient(&e) => continue,
            // ICMP errors from earlier sends surface here; they do not end the listener.
            Err(e) => debug!("Datagram receive error: {}", e),
        }
    }

    debug!("Datagram loop stopped");
}
