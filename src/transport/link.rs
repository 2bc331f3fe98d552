//! Client Link
//!
//! One connected socket owned by a client session. A link is created fresh
//! for every connect attempt and is never reused once closed.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::{TcpStream, UdpSocket};

use super::{
    is_transient, peer_closed, send_datagram, write_fully, CLIENT_WRITE_RETRY_LIMIT,
    DATAGRAM_POLL_TICK, MAX_DATAGRAM_SIZE,
};
use crate::config::{ClientConfig, ExecutionModel, Protocol};

/// Socket parameters copied out of the client configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkOptions {
    pub protocol: Protocol,
    pub execution_model: ExecutionModel,
    pub keep_alive: bool,
    pub connect_timeout: Duration,
}

impl From<&ClientConfig> for LinkOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            protocol: config.protocol,
            execution_model: config.execution_model,
            keep_alive: config.keep_alive,
            connect_timeout: config.connect_timeout,
        }
    }
}

enum LinkKind {
    Stream(TcpStream),
    Datagram(UdpSocket),
    BlockingStream(std::net::TcpStream),
    BlockingDatagram(std::net::UdpSocket),
}

pub(crate) struct Link {
    kind: LinkKind,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            LinkKind::Stream(_) => "tcp",
            LinkKind::Datagram(_) => "udp",
            LinkKind::BlockingStream(_) => "tcp-blocking",
            LinkKind::BlockingDatagram(_) => "udp-blocking",
        };
        f.debug_struct("Link")
            .field("kind", &kind)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

fn detached_task(err: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("blocking socket task failed: {}", err))
}

impl Link {
    fn new(kind: LinkKind, peer: SocketAddr) -> Self {
        Self {
            kind,
            peer,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a link for the configured model. Must run on an event loop.
    pub async fn open(addr: SocketAddr, options: LinkOptions) -> io::Result<Link> {
        match options.execution_model {
            ExecutionModel::EventLoop => Self::connect(addr, options).await,
            ExecutionModel::Blocking => {
                tokio::task::spawn_blocking(move || Self::connect_blocking(addr, options))
                    .await
                    .map_err(detached_task)?
            }
        }
    }

    async fn connect(addr: SocketAddr, options: LinkOptions) -> io::Result<Link> {
        match options.protocol {
            Protocol::Tcp => {
                let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect to {} timed out", addr),
                        )
                    })??;
                stream.set_nodelay(true)?;
                if options.keep_alive {
                    SockRef::from(&stream).set_keepalive(true)?;
                }
                Ok(Self::new(LinkKind::Stream(stream), addr))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(unspecified_for(&addr)).await?;
                socket.connect(addr).await?;
                Ok(Self::new(LinkKind::Datagram(socket), addr))
            }
        }
    }

    /// Open a blocking-socket link on the calling thread
    pub fn connect_blocking(addr: SocketAddr, options: LinkOptions) -> io::Result<Link> {
        match options.protocol {
            Protocol::Tcp => {
                let stream = std::net::TcpStream::connect_timeout(&addr, options.connect_timeout)?;
                stream.set_nodelay(true)?;
                if options.keep_alive {
                    SockRef::from(&stream).set_keepalive(true)?;
                }
                Ok(Self::new(LinkKind::BlockingStream(stream), addr))
            }
            Protocol::Udp => {
                let socket = std::net::UdpSocket::bind(unspecified_for(&addr))?;
                socket.connect(addr)?;
                socket.set_read_timeout(Some(DATAGRAM_POLL_TICK))?;
                Ok(Self::new(LinkKind::BlockingDatagram(socket), addr))
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the socket is a std blocking socket usable from any thread
    pub fn is_blocking(&self) -> bool {
        matches!(
            self.kind,
            LinkKind::BlockingStream(_) | LinkKind::BlockingDatagram(_)
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            Err(io::Error::new(io::ErrorKind::NotConnected, "link is closed"))
        } else {
            Ok(())
        }
    }

    /// Write the whole buffer
    pub async fn write_all(self: Arc<Self>, data: Bytes) -> io::Result<()> {
        self.ensure_open()?;

        match &self.kind {
            LinkKind::Stream(stream) => {
                let mut written = 0;
                while written < data.len() {
                    stream.writable().await?;
                    match stream.try_write(&data[written..]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "peer stopped accepting data",
                            ))
                        }
                        Ok(n) => written += n,
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            LinkKind::Datagram(socket) => {
                let sent = socket.send(&data).await?;
                if sent < data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("datagram truncated: sent {} of {} bytes", sent, data.len()),
                    ));
                }
                Ok(())
            }
            LinkKind::BlockingStream(_) | LinkKind::BlockingDatagram(_) => {
                let link = Arc::clone(&self);
                tokio::task::spawn_blocking(move || link.write_all_blocking(&data))
                    .await
                    .map_err(detached_task)?
            }
        }
    }

    /// Write the whole buffer on the calling thread (blocking links only)
    pub fn write_all_blocking(&self, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;

        match &self.kind {
            LinkKind::BlockingStream(stream) => {
                let mut writer = stream;
                write_fully(&mut writer, data, CLIENT_WRITE_RETRY_LIMIT)
            }
            LinkKind::BlockingDatagram(socket) => {
                send_datagram(|| socket.send(data), data.len(), CLIENT_WRITE_RETRY_LIMIT)
            }
            LinkKind::Stream(_) | LinkKind::Datagram(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "event loop links cannot be driven from a foreign thread",
            )),
        }
    }

    /// Read one chunk of at most `max` bytes (one datagram for UDP)
    pub async fn read_chunk(self: Arc<Self>, max: usize) -> io::Result<Bytes> {
        self.ensure_open()?;

        match &self.kind {
            LinkKind::Stream(stream) => {
                let mut buf = vec![0u8; max];
                loop {
                    stream.readable().await?;
                    match stream.try_read(&mut buf) {
                        Ok(0) => return Err(peer_closed()),
                        Ok(n) => {
                            buf.truncate(n);
                            return Ok(Bytes::from(buf));
                        }
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            LinkKind::Datagram(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            LinkKind::BlockingStream(_) | LinkKind::BlockingDatagram(_) => {
                let link = Arc::clone(&self);
                tokio::task::spawn_blocking(move || link.read_chunk_blocking(max))
                    .await
                    .map_err(detached_task)?
            }
        }
    }

    /// Read one chunk on the calling thread (blocking links only)
    pub fn read_chunk_blocking(&self, max: usize) -> io::Result<Bytes> {
        self.ensure_open()?;

        match &self.kind {
            LinkKind::BlockingStream(stream) => {
                let mut reader = stream;
                let mut buf = vec![0u8; max];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => return Err(peer_closed()),
                        Ok(n) => {
                            buf.truncate(n);
                            return Ok(Bytes::from(buf));
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            LinkKind::BlockingDatagram(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    self.ensure_open()?;
                    match socket.recv(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            return Ok(Bytes::from(buf));
                        }
                        // The read timeout is only a tick to observe close().
                        Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            LinkKind::Stream(_) | LinkKind::Datagram(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "event loop links cannot be driven from a foreign thread",
            )),
        }
    }

    /// Shut the socket down so pending reads fail promptly. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = match &self.kind {
            LinkKind::Stream(stream) => SockRef::from(stream).shutdown(Shutdown::Both),
            LinkKind::BlockingStream(stream) => stream.shutdown(Shutdown::Both),
            LinkKind::Datagram(_) | LinkKind::BlockingDatagram(_) => Ok(()),
        };

        match result {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options(protocol: Protocol, execution_model: ExecutionModel) -> LinkOptions {
        LinkOptions {
            protocol,
            execution_model,
            keep_alive: true,
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_blocking_stream_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let link = Link::connect_blocking(addr, options(Protocol::Tcp, ExecutionModel::Blocking)).unwrap();
        assert!(link.is_blocking());
        link.write_all_blocking(b"hello").unwrap();
        let reply = link.read_chunk_blocking(1024).unwrap();
        assert_eq!(&reply[..], b"hello");

        server.join().unwrap();
        link.close().unwrap();
        link.close().unwrap();
        assert!(link.write_all_blocking(b"late").is_err());
    }

    #[test]
    fn test_blocking_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Link::connect_blocking(addr, options(Protocol::Tcp, ExecutionModel::Blocking)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_event_loop_stream_detects_peer_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            drop(conn);
        });

        let link = Arc::new(
            Link::open(addr, options(Protocol::Tcp, ExecutionModel::EventLoop))
                .await
                .unwrap(),
        );
        accept.await.unwrap();

        let err = Arc::clone(&link).read_chunk(1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_event_loop_datagram_exchange() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let link = Arc::new(
            Link::open(addr, options(Protocol::Udp, ExecutionModel::EventLoop))
                .await
                .unwrap(),
        );
        Arc::clone(&link)
            .write_all(Bytes::from_static(b"ping"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).await.unwrap();

        let reply = Arc::clone(&link).read_chunk(1024).await.unwrap();
        assert_eq!(&reply[..], b"pong");
    }
}
