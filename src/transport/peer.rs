//! Server-side peer handles and bind helpers
//!
//! Server sockets are non-blocking std sockets so that `send` can be issued
//! from any thread (including user callbacks running on the listener's
//! worker) without going through the reactor.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use super::{send_datagram, write_fully};
use crate::error::{NetError, NetResult};

/// Backlog for listening stream sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Accepted stream plus a lock serializing concurrent writers
#[derive(Debug)]
pub(crate) struct StreamPeer {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

/// Transport handle stored in a connection record
#[derive(Debug, Clone)]
pub(crate) enum PeerHandle {
    Stream(Arc<StreamPeer>),
    /// Shared listening socket; replies go to the record's remote address
    Datagram(Arc<UdpSocket>),
}

impl PeerHandle {
    pub fn stream(stream: TcpStream) -> Self {
        PeerHandle::Stream(Arc::new(StreamPeer {
            stream,
            write_lock: Mutex::new(()),
        }))
    }

    pub fn datagram(socket: Arc<UdpSocket>) -> Self {
        PeerHandle::Datagram(socket)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, PeerHandle::Stream(_))
    }

    /// Full-buffer write with retry on would-block
    pub fn send(&self, remote: SocketAddr, data: &[u8], retry_limit: u32) -> io::Result<()> {
        match self {
            PeerHandle::Stream(peer) => {
                let _guard = peer
                    .write_lock
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let mut writer = &peer.stream;
                write_fully(&mut writer, data, retry_limit)
            }
            PeerHandle::Datagram(socket) => {
                send_datagram(|| socket.send_to(data, remote), data.len(), retry_limit)
            }
        }
    }

    /// Best-effort shutdown; datagram peers share the listening socket
    pub fn close(&self) -> io::Result<()> {
        match self {
            PeerHandle::Stream(peer) => match peer.stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            PeerHandle::Datagram(_) => Ok(()),
        }
    }
}

/// Bind a non-blocking listening stream socket with `SO_REUSEADDR`
pub(crate) fn bind_stream_listener(addr: SocketAddr) -> NetResult<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))
        .map_err(|e| NetError::from_bind(&e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::from_bind(&e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::from_bind(&e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| NetError::from_bind(&e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::from_bind(&e))?;
    Ok(socket.into())
}

/// Bind a non-blocking datagram socket
pub(crate) fn bind_datagram_socket(addr: SocketAddr) -> NetResult<UdpSocket> {
    let socket = UdpSocket::bind(addr).map_err(|e| NetError::from_bind(&e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::from_bind(&e))?;
    Ok(socket)
}
