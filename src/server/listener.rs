//! Server Listener
//!
//! Owns the bound socket, the worker that accepts and reads (an event loop
//! or a poll thread, chosen by the execution model) and the connection
//! registry. Both workers look the same from the outside.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::callbacks::ServerCallbacks;
use super::dispatcher::{self, BoundSocket, ServerContext};
use super::registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
use crate::config::{ExecutionModel, Protocol, ServerConfig};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::event_loop::EventLoop;
use crate::transport::{bind_datagram_socket, bind_stream_listener, PeerHandle};

/// Listener statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the listener, its senders and its workers
pub(crate) struct ListenerCore {
    pub registry: ConnectionRegistry,
    running: AtomicBool,
    send_retry_limit: AtomicU32,
    datagram_socket: Mutex<Option<Arc<UdpSocket>>>,
    total_connections: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ListenerCore {
    fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            running: AtomicBool::new(false),
            send_retry_limit: AtomicU32::new(ServerConfig::default().send_retry_limit),
            datagram_socket: Mutex::new(None),
            total_connections: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Id for a datagram peer on `socket`, registering it on first sight
    pub fn assign_datagram_peer(&self, remote: SocketAddr, socket: &Arc<UdpSocket>) -> ConnectionId {
        let (id, fresh) = self
            .registry
            .get_or_assign(remote, || PeerHandle::datagram(Arc::clone(socket)));
        if fresh {
            self.record_connection();
            debug!("Assigned id {} to datagram peer {}", id, remote);
        }
        id
    }

    fn get_or_assign_client_id(&self, remote: SocketAddr) -> NetResult<ConnectionId> {
        let socket = lock(&self.datagram_socket)
            .clone()
            .ok_or_else(|| NetError::not_connected("listener has no datagram socket"))?;
        Ok(self.assign_datagram_peer(remote, &socket))
    }

    fn send(&self, id: ConnectionId, data: &[u8]) -> NetResult<()> {
        let record = self
            .registry
            .lookup(id)
            .ok_or_else(|| NetError::not_connected(format!("no connection with id {}", id)))?;
        self.deliver(record.remote, &record.handle, data)
    }

    fn send_to_address(&self, remote: SocketAddr, data: &[u8]) -> NetResult<()> {
        let record = self
            .registry
            .find_by_address(remote)
            .ok_or_else(|| NetError::not_connected(format!("no connection from {}", remote)))?;
        self.deliver(record.remote, &record.handle, data)
    }

    fn deliver(&self, remote: SocketAddr, handle: &PeerHandle, data: &[u8]) -> NetResult<()> {
        let retry_limit = self.send_retry_limit.load(Ordering::Relaxed);
        handle
            .send(remote, data, retry_limit)
            .map_err(|e| NetError::from_send(&e))?;
        self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> ListenerStats {
        ListenerStats {
            active_connections: self.registry.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

enum Backend {
    EventLoop {
        event_loop: EventLoop,
        stop: CancellationToken,
    },
    #[cfg(unix)]
    Poller(super::poller::PollWorker),
}

impl Backend {
    /// Stop accepting and reading; joins the worker unless called from it
    fn stop(self) {
        match self {
            Backend::EventLoop { event_loop, stop } => {
                stop.cancel();
                event_loop.shutdown();
            }
            #[cfg(unix)]
            Backend::Poller(worker) => worker.stop(),
        }
    }
}

/// One listen cycle
struct Worker {
    context: Arc<ServerContext>,
    local_addr: SocketAddr,
    backend: Backend,
}

/// Cloneable handle for replying from inside callbacks
#[derive(Clone)]
pub struct ServerSender {
    core: Arc<ListenerCore>,
}

impl ServerSender {
    pub fn send(&self, id: ConnectionId, data: &[u8]) -> NetResult<()> {
        self.core.send(id, data)
    }

    pub fn send_to_address(&self, remote: SocketAddr, data: &[u8]) -> NetResult<()> {
        self.core.send_to_address(remote, data)
    }

    pub fn get_or_assign_client_id(&self, remote: SocketAddr) -> NetResult<ConnectionId> {
        self.core.get_or_assign_client_id(remote)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core.registry.snapshot()
    }
}

pub struct ServerListener {
    core: Arc<ListenerCore>,
    worker: Mutex<Option<Worker>>,
}

impl Default for ServerListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerListener {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ListenerCore::new()),
            worker: Mutex::new(None),
        }
    }

    /// Bind and start serving; returns once the socket is bound.
    pub fn listen(&self, config: ServerConfig, callbacks: ServerCallbacks) -> NetResult<()> {
        let mut slot = lock(&self.worker);
        if let Some(worker) = slot.as_ref() {
            return Err(NetError::new(
                ErrorKind::ConnectionFailed,
                format!("already listening on {}", worker.local_addr),
            ));
        }

        let bind_addr = config.bind_addr();
        let socket = match config.protocol {
            Protocol::Tcp => BoundSocket::Stream(bind_stream_listener(bind_addr)?),
            Protocol::Udp => BoundSocket::Datagram(Arc::new(bind_datagram_socket(bind_addr)?)),
        };
        let local_addr = socket.local_addr().map_err(|e| NetError::from_bind(&e))?;

        self.core
            .send_retry_limit
            .store(config.send_retry_limit, Ordering::Relaxed);
        if let BoundSocket::Datagram(udp) = &socket {
            *lock(&self.core.datagram_socket) = Some(Arc::clone(udp));
        }
        self.core.running.store(true, Ordering::SeqCst);

        let context = Arc::new(ServerContext {
            core: Arc::clone(&self.core),
            callbacks,
            buffer_size: config.buffer_size.max(1),
        });

        let backend = match self.start_backend(&config, Arc::clone(&context), socket, local_addr) {
            Ok(backend) => backend,
            Err(e) => {
                self.core.running.store(false, Ordering::SeqCst);
                *lock(&self.core.datagram_socket) = None;
                return Err(e);
            }
        };

        info!(
            "Listening on {} ({:?}, {:?})",
            local_addr, config.protocol, config.execution_model
        );

        *slot = Some(Worker {
            context,
            local_addr,
            backend,
        });
        Ok(())
    }

    fn start_backend(
        &self,
        config: &ServerConfig,
        context: Arc<ServerContext>,
        socket: BoundSocket,
        local_addr: SocketAddr,
    ) -> NetResult<Backend> {
        match config.execution_model {
            ExecutionModel::EventLoop => {
                let event_loop = EventLoop::start(&format!("netbridge-server-{}", local_addr.port()))?;
                let stop = CancellationToken::new();
                dispatcher::spawn(event_loop.handle(), context, socket, stop.clone());
                Ok(Backend::EventLoop { event_loop, stop })
            }
            #[cfg(unix)]
            ExecutionModel::Blocking => {
                let worker = super::poller::PollWorker::start(context, socket, config.poll_interval)?;
                Ok(Backend::Poller(worker))
            }
            #[cfg(not(unix))]
            ExecutionModel::Blocking => {
                drop((context, socket));
                Err(NetError::new(
                    ErrorKind::NotImplemented,
                    "blocking server model requires poll(2)",
                ))
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Bound address of the current listen cycle
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.worker).as_ref().map(|worker| worker.local_addr)
    }

    pub fn sender(&self) -> ServerSender {
        ServerSender {
            core: Arc::clone(&self.core),
        }
    }

    pub fn send(&self, id: ConnectionId, data: &[u8]) -> NetResult<()> {
        self.core.send(id, data)
    }

    pub fn send_to_address(&self, remote: SocketAddr, data: &[u8]) -> NetResult<()> {
        self.core.send_to_address(remote, data)
    }

    /// Id for a datagram peer (UDP listeners only); idempotent per address
    pub fn get_or_assign_client_id(&self, remote: SocketAddr) -> NetResult<ConnectionId> {
        self.core.get_or_assign_client_id(remote)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core.registry.snapshot()
    }

    pub fn stats(&self) -> ListenerStats {
        self.core.stats()
    }

    /// Stop serving and tear every connection down. Idempotent.
    ///
    /// on_disconnect fires for each connection closed here before this
    /// returns; no callback fires afterwards.
    pub fn graceful_shutdown(&self) -> NetResult<()> {
        let worker = match lock(&self.worker).take() {
            Some(worker) => worker,
            None => return Ok(()),
        };

        self.core.running.store(false, Ordering::SeqCst);
        worker.backend.stop();
        *lock(&self.core.datagram_socket) = None;

        let drained = self.core.registry.drain();
        let count = drained.len();
        let mut failure = None;

        for record in drained {
            if let Err(e) = record.handle.close() {
                warn!("Failed to close connection {}: {}", record.id, e);
                failure.get_or_insert_with(|| {
                    NetError::new(
                        ErrorKind::DisconnectionFailed,
                        format!("closing connection {}: {}", record.id, e),
                    )
                });
            }
            // Datagram peers never announced a connection, so they get no disconnect either.
            if record.handle.is_stream() {
                worker.context.emit_disconnect(record.id, record.remote);
            }
        }

        info!(
            "Listener on {} shut down, {} connection(s) closed",
            worker.local_addr, count
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ServerListener {
    fn drop(&mut self) {
        let _ = self.graceful_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback(protocol: Protocol, model: ExecutionModel) -> ServerConfig {
        ServerConfig::new(0)
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_protocol(protocol)
            .with_execution_model(model)
    }

    #[test]
    fn test_listen_twice_fails() {
        let listener = ServerListener::new();
        listener
            .listen(loopback(Protocol::Tcp, ExecutionModel::EventLoop), ServerCallbacks::new())
            .unwrap();
        assert!(listener.local_addr().is_some_and(|addr| addr.port() != 0));

        let err = listener
            .listen(loopback(Protocol::Tcp, ExecutionModel::EventLoop), ServerCallbacks::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        listener.graceful_shutdown().unwrap();
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let listener = ServerListener::new();
        listener
            .listen(loopback(Protocol::Tcp, ExecutionModel::EventLoop), ServerCallbacks::new())
            .unwrap();

        assert_eq!(listener.send(42, b"x").unwrap_err().kind(), ErrorKind::NotConnected);
        let nowhere: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(
            listener.send_to_address(nowhere, b"x").unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_client_ids_require_datagram_listener() {
        let listener = ServerListener::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(
            listener.get_or_assign_client_id(peer).unwrap_err().kind(),
            ErrorKind::NotConnected
        );

        listener
            .listen(loopback(Protocol::Udp, ExecutionModel::EventLoop), ServerCallbacks::new())
            .unwrap();
        let id = listener.get_or_assign_client_id(peer).unwrap();
        assert_eq!(listener.get_or_assign_client_id(peer).unwrap(), id);
        assert_eq!(listener.stats().active_connections, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_allows_relisten() {
        let listener = ServerListener::new();
        assert!(listener.graceful_shutdown().is_ok());

        for model in [ExecutionModel::EventLoop, ExecutionModel::Blocking] {
            listener
                .listen(loopback(Protocol::Udp, model), ServerCallbacks::new())
                .unwrap();
            let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
            listener.get_or_assign_client_id(peer).unwrap();

            listener.graceful_shutdown().unwrap();
            listener.graceful_shutdown().unwrap();
            assert!(!listener.is_listening());
            assert!(listener.connections().is_empty());
        }

        // Ids keep counting across listen cycles.
        assert_eq!(listener.stats().total_connections, 2);
    }

    #[test]
    fn test_stream_accepted_during_shutdown_is_not_registered() {
        let core = Arc::new(ListenerCore::new());
        let connects = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connects);
        let context = ServerContext {
            core: Arc::clone(&core),
            callbacks: ServerCallbacks::new().on_connect(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            buffer_size: 1024,
        };

        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let _late = std::net::TcpStream::connect(addr).unwrap();
        let (stream, remote) = server.accept().unwrap();
        assert!(context.register_stream(remote, stream).is_none());
        assert!(core.registry.is_empty());
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert_eq!(core.stats().total_connections, 0);

        core.running.store(true, Ordering::SeqCst);
        let _accepted = std::net::TcpStream::connect(addr).unwrap();
        let (stream, remote) = server.accept().unwrap();
        let id = context.register_stream(remote, stream).unwrap();
        assert!(core.registry.lookup(id).is_some());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(core.stats().total_connections, 1);
    }
}
