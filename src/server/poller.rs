//! Blocking-model server worker
//!
//! One OS thread multiplexes the listening socket and every accepted
//! stream with `poll(2)`, waking at least every `poll_interval` to observe
//! the stop flag. All sockets are non-blocking; ready sockets are drained
//! until they report `WouldBlock`.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, warn};

use super::dispatcher::{BoundSocket, ServerContext};
use super::registry::ConnectionId;
use crate::error::{NetError, NetResult};
use crate::transport::MAX_DATAGRAM_SIZE;

/// Handle on a running poll thread
pub(crate) struct PollWorker {
    thread: JoinHandle<()>,
    thread_id: ThreadId,
    stop: Arc<AtomicBool>,
}

impl PollWorker {
    pub fn start(context: Arc<ServerContext>, socket: BoundSocket, poll_interval: Duration) -> NetResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let timeout = poll_timeout(poll_interval);

        let thread = thread::Builder::new()
            .name("netbridge-poller".to_string())
            .spawn(move || match socket {
                BoundSocket::Stream(listener) => run_stream(&context, listener, &flag, timeout),
                BoundSocket::Datagram(socket) => run_datagram(&context, socket, &flag, timeout),
            })
            .map_err(|e| NetError::internal(format!("failed to spawn poll worker: {}", e)))?;

        let thread_id = thread.thread().id();
        Ok(Self {
            thread,
            thread_id,
            stop,
        })
    }

    /// Raise the stop flag and join, unless called from the worker itself
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);

        if thread::current().id() == self.thread_id {
            return;
        }
        if self.thread.join().is_err() {
            warn!("Poll worker thread panicked");
        }
    }
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = interval.as_millis().clamp(1, u128::from(u16::MAX)) as u16;
    PollTimeout::from(millis)
}

/// Poll `fds`; `Ok(false)` on timeout or interruption
fn wait(fds: &mut [PollFd<'_>], timeout: PollTimeout) -> io::Result<bool> {
    match poll(fds, timeout) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|events| !events.is_empty())
}

struct StreamClient {
    id: ConnectionId,
    remote: SocketAddr,
    stream: TcpStream,
}

fn run_stream(context: &ServerContext, listener: TcpListener, stop: &AtomicBool, timeout: PollTimeout) {
    let mut clients: Vec<StreamClient> = Vec::new();
    let mut buf = vec![0u8; context.buffer_size];

    while !stop.load(Ordering::SeqCst) {
        let ready: Vec<bool> = {
            let mut fds = Vec::with_capacity(clients.len() + 1);
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            for client in &clients {
                fds.push(PollFd::new(client.stream.as_fd(), PollFlags::POLLIN));
            }

            match wait(&mut fds, timeout) {
                Ok(true) => fds.iter().map(is_ready).collect(),
                Ok(false) => continue,
                Err(e) => {
                    error!("Poll failed, stopping worker: {}", e);
                    break;
                }
            }
        };

        if stop.load(Ordering::SeqCst) {
            break;
        }

        if ready[0] {
            accept_pending(context, &listener, &mut clients);
        }

        // ready[slot + 1] belongs to clients[slot]; walk backwards so swap_remove keeps earlier slots valid.
        for slot in (0..ready.len() - 1).rev() {
            if !ready[slot + 1] {
                continue;
            }
            if !drain_client(context, &mut clients[slot], &mut buf) {
                let client = clients.swap_remove(slot);
                context.close_connection(client.id);
            }
        }
    }

    debug!("Stream poll worker stopped");
}

fn accept_pending(context: &ServerContext, listener: &TcpListener, clients: &mut Vec<StreamClient>) {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let registered = stream
                    .set_nonblocking(true)
                    .and_then(|_| stream.try_clone());
                match registered {
                    Ok(writer) => {
                        if let Some(id) = context.register_stream(remote, writer) {
                            clients.push(StreamClient { id, remote, stream });
                        }
                    }
                    Err(e) => warn!("Dropping connection from {}: {}", remote, e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Accept failed: {}", e);
                return;
            }
        }
    }
}

/// Read until the socket would block. Returns false once the connection is finished.
fn drain_client(context: &ServerContext, client: &mut StreamClient, buf: &mut [u8]) -> bool {
    loop {
        match client.stream.read(buf) {
            Ok(0) => {
                debug!("Connection {} closed by peer", client.id);
                return false;
            }
            Ok(n) => context.emit_receive(client.id, client.remote, Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Read on connection {} failed: {}", client.id, e);
                return false;
            }
        }
    }
}

fn run_datagram(context: &ServerContext, socket: Arc<UdpSocket>, stop: &AtomicBool, timeout: PollTimeout) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while !stop.load(Ordering::SeqCst) {
        {
            let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
            match wait(&mut fds, timeout) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("Poll failed, stopping worker: {}", e);
                    break;
                }
            }
        }

        if stop.load(Ordering::SeqCst) {
            break;
        }

        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, remote)) => {
                    context.dispatch_datagram(&socket, remote, Bytes::copy_from_slice(&buf[..n]))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Datagram receive error: {}", e);
                    break;
                }
            }
        }
    }

    debug!("Datagram poll worker stopped");
}
