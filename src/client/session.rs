//! Client Session
//!
//! One outbound logical connection. The socket underneath may be replaced
//! any number of times by the reconnect loop; the session itself stays the
//! same object for the caller.
//!
//! All mutable state sits behind one mutex (the session's execution
//! context). Every installed link carries an id, and every connect/read
//! continuation carries the cancellation scope it was started under, so a
//! completion that belongs to a discarded link or a cancelled scope can
//! never touch the current one.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::ReconnectController;
use crate::config::{ClientConfig, ExecutionModel};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::event_loop::EventLoop;
use crate::transport::{Link, LinkOptions};

/// Lifecycle state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone)]
struct ActiveLink {
    id: u64,
    link: Arc<Link>,
}

struct SessionInner {
    state: SessionState,
    /// Present iff `state == Connected`
    link: Option<ActiveLink>,
    next_link_id: u64,
    ever_connected: bool,
    reconnect: ReconnectController,
    /// Cancelled by every explicit connect/disconnect
    scope: CancellationToken,
}

impl SessionInner {
    fn install(&mut self, link: Link) -> u64 {
        let id = self.next_link_id;
        self.next_link_id += 1;
        self.link = Some(ActiveLink {
            id,
            link: Arc::new(link),
        });
        self.state = SessionState::Connected;
        self.ever_connected = true;
        self.reconnect.reset();
        id
    }

    fn discard_link(&mut self) -> std::io::Result<()> {
        match self.link.take() {
            Some(active) => active.link.close(),
            None => Ok(()),
        }
    }

    fn renew_scope(&mut self) {
        self.scope.cancel();
        self.scope = CancellationToken::new();
    }
}

/// State shared between the session handle and its continuations
struct SessionCore {
    config: ClientConfig,
    options: LinkOptions,
    handle: Handle,
    inner: Mutex<SessionInner>,
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate the address, cancel whatever the session was doing and enter Connecting
    fn begin_connect(&self) -> NetResult<(SocketAddr, CancellationToken)> {
        let addr = self.config.address.resolve()?;

        let mut inner = self.lock();
        inner.renew_scope();
        if let Err(e) = inner.discard_link() {
            debug!("Ignoring close error on discarded link: {}", e);
        }
        inner.reconnect.reset();
        inner.state = SessionState::Connecting;

        Ok((addr, inner.scope.clone()))
    }

    fn finish_connect(&self, scope: &CancellationToken, attempt: NetResult<Link>) -> NetResult<()> {
        let mut inner = self.lock();

        if scope.is_cancelled() {
            if let Ok(link) = attempt {
                let _ = link.close();
            }
            return Err(NetError::not_connected(
                "connect attempt superseded by disconnect",
            ));
        }

        match attempt {
            Ok(link) => {
                let peer = link.peer();
                let id = inner.install(link);
                info!("Connected to {} at {} (link {})", self.config.address, peer, id);
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Disconnected;
                warn!("Connect to {} failed: {}", self.config.address, e);
                Err(e)
            }
        }
    }

    fn current(&self) -> NetResult<(ActiveLink, CancellationToken)> {
        let inner = self.lock();
        match (inner.state, &inner.link) {
            (SessionState::Connected, Some(active)) => Ok((active.clone(), inner.scope.clone())),
            (state, _) => Err(NetError::not_connected(format!(
                "session {} is {:?}",
                self.config.address, state
            ))),
        }
    }

    /// A data operation on link `link_id` failed; drop it and start recovering
    fn fail_link(self: &Arc<Self>, link_id: u64) {
        let mut inner = self.lock();

        let is_current = inner.link.as_ref().map(|active| active.id) == Some(link_id);
        if !is_current {
            return;
        }

        let _ = inner.discard_link();
        inner.state = SessionState::Disconnected;
        warn!("Connection to {} lost (link {})", self.config.address, link_id);

        self.start_reconnect(&mut inner);
    }

    /// A `connect_async` failed; recover only sessions that were connected before
    fn recover_after_connect_failure(self: &Arc<Self>, scope: &CancellationToken) {
        let mut inner = self.lock();
        if scope.is_cancelled() || inner.state != SessionState::Disconnected {
            return;
        }
        self.start_reconnect(&mut inner);
    }

    fn start_reconnect(self: &Arc<Self>, inner: &mut SessionInner) {
        if !self.config.auto_reconnect.enabled || !inner.ever_connected {
            return;
        }

        if !inner.reconnect.try_start() {
            debug!("Reconnect loop for {} already running", self.config.address);
            return;
        }

        inner.state = SessionState::Reconnecting;
        let scope = inner.scope.clone();
        let core = Arc::clone(self);
        self.handle.spawn(async move { core.reconnect_loop(scope).await });
    }

    async fn reconnect_loop(self: Arc<Self>, scope: CancellationToken) {
        loop {
            let delay = {
                let mut inner = self.lock();
                if scope.is_cancelled() {
                    return;
                }
                match inner.reconnect.next_attempt() {
                    Some(delay) => delay,
                    None => {
                        warn!(
                            "Giving up reconnecting to {} after {} attempts",
                            self.config.address,
                            inner.reconnect.attempts_made()
                        );
                        inner.reconnect.reset();
                        inner.state = SessionState::Disconnected;
                        return;
                    }
                }
            };

            debug!("Reconnecting to {} in {:?}", self.config.address, delay);
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let addr = match self.config.address.resolve() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("Cannot reconnect to {}: {}", self.config.address, e);
                    let mut inner = self.lock();
                    if !scope.is_cancelled() {
                        inner.reconnect.reset();
                        inner.state = SessionState::Disconnected;
                    }
                    return;
                }
            };

            let attempt = tokio::select! {
                _ = scope.cancelled() => return,
                result = Link::open(addr, self.options) => result,
            };

            let mut inner = self.lock();
            if scope.is_cancelled() {
                if let Ok(link) = attempt {
                    let _ = link.close();
                }
                return;
            }

            match attempt {
                Ok(link) => {
                    let attempts = inner.reconnect.attempts_made();
                    let id = inner.install(link);
                    info!(
                        "Reconnected to {} after {} attempt(s) (link {})",
                        self.config.address, attempts, id
                    );
                    return;
                }
                Err(e) => {
                    inner.reconnect.record_failure();
                    debug!(
                        "Reconnect attempt {} to {} failed: {}",
                        inner.reconnect.attempts_made(),
                        self.config.address,
                        e
                    );
                }
            }
        }
    }

    fn disconnect(&self) -> NetResult<()> {
        let mut inner = self.lock();
        inner.renew_scope();
        inner.reconnect.reset();
        let closed = inner.discard_link();
        inner.state = SessionState::Disconnected;

        closed.map_err(|e| NetError::new(ErrorKind::DisconnectionFailed, e.to_string()))
    }
}

/// Client connection with a unified sync/async contract and automatic reconnect.
///
/// Callbacks of the `*_async` operations run on the session's event-loop
/// thread. Blocking operations issued from inside such a callback fail with
/// `InternalError` for event-loop sessions instead of deadlocking.
pub struct ClientSession {
    core: Arc<SessionCore>,
    event_loop: EventLoop,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> NetResult<Self> {
        config.validate().map_err(|e| {
            NetError::new(
                ErrorKind::InternalError,
                format!("invalid client configuration: {:#}", e),
            )
        })?;

        let event_loop = EventLoop::start(&format!("netbridge-client-{}", config.address))?;

        let inner = SessionInner {
            state: SessionState::Disconnected,
            link: None,
            next_link_id: 1,
            ever_connected: false,
            reconnect: ReconnectController::new(config.auto_reconnect.clone()),
            scope: CancellationToken::new(),
        };

        let core = Arc::new(SessionCore {
            options: LinkOptions::from(&config),
            handle: event_loop.handle().clone(),
            inner: Mutex::new(inner),
            config,
        });

        Ok(Self { core, event_loop })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// `host:port` of the remote endpoint
    pub fn description(&self) -> String {
        self.core.config.address.to_string()
    }

    /// Attempts made by the reconnect loop currently running (0 when idle)
    pub fn reconnect_attempts(&self) -> u32 {
        self.core.lock().reconnect.attempts_made()
    }

    /// Blocking one-shot connect. Never starts the reconnect loop.
    pub fn connect(&self) -> NetResult<()> {
        let (addr, scope) = self.core.begin_connect()?;
        let options = self.core.options;
        debug!("Connecting to {} ({:?})", addr, options.execution_model);

        let attempt = match options.execution_model {
            ExecutionModel::Blocking => {
                Link::connect_blocking(addr, options).map_err(|e| NetError::from_connect(&e))
            }
            ExecutionModel::EventLoop => self
                .event_loop
                .block_on(Link::open(addr, options))
                .and_then(|result| result.map_err(|e| NetError::from_connect(&e))),
        };

        self.core.finish_connect(&scope, attempt)
    }

    /// Connect without blocking; `callback` fires exactly once
    pub fn connect_async<F>(&self, callback: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        let (addr, scope) = match self.core.begin_connect() {
            Ok(target) => target,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };

        let core = Arc::clone(&self.core);
        self.core.handle.spawn(async move {
            let attempt = tokio::select! {
                _ = scope.cancelled() => Err(NetError::not_connected("connect attempt superseded by disconnect")),
                result = Link::open(addr, core.options) => result.map_err(|e| NetError::from_connect(&e)),
            };

            let result = core.finish_connect(&scope, attempt);
            if result.is_err() {
                core.recover_after_connect_failure(&scope);
            }
            callback(result);
        });
    }

    /// Write the whole buffer, blocking the caller
    pub fn send_sync(&self, data: &[u8]) -> NetResult<()> {
        let (active, _) = self.core.current()?;

        let written = if active.link.is_blocking() {
            active.link.write_all_blocking(data)
        } else {
            let payload = Bytes::copy_from_slice(data);
            self.event_loop
                .block_on(Arc::clone(&active.link).write_all(payload))?
        };

        written.map_err(|e| {
            self.core.fail_link(active.id);
            NetError::from_send(&e)
        })
    }

    /// Write the whole buffer on the event loop; `callback` fires exactly once
    pub fn send_async<F>(&self, data: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        let (active, scope) = match self.core.current() {
            Ok(current) => current,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };

        let data = data.into();
        let core = Arc::clone(&self.core);
        self.core.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = scope.cancelled() => Err(NetError::not_connected("send cancelled by disconnect")),
                written = Arc::clone(&active.link).write_all(data) => written.map_err(|e| {
                    core.fail_link(active.id);
                    NetError::from_send(&e)
                }),
            };
            callback(result);
        });
    }

    /// One blocking read of up to `buffer_size` bytes (one datagram for UDP)
    pub fn receive_sync(&self) -> NetResult<Bytes> {
        let (active, _) = self.core.current()?;
        let max = self.core.config.buffer_size;

        let read = if active.link.is_blocking() {
            active.link.read_chunk_blocking(max)
        } else {
            self.event_loop
                .block_on(Arc::clone(&active.link).read_chunk(max))?
        };

        read.map_err(|e| {
            self.core.fail_link(active.id);
            NetError::from_receive(&e)
        })
    }

    /// Arm a persistent read.
    ///
    /// Every chunk is delivered as `Ok(bytes)` and the read re-arms itself.
    /// A failed read delivers one `Err(ReceiveFailed)` after scheduling the
    /// reconnect loop and ends this read; a disconnect ends it with one
    /// `Err(NotConnected)`.
    pub fn receive_async<F>(&self, mut callback: F)
    where
        F: FnMut(NetResult<Bytes>) + Send + 'static,
    {
        let (active, scope) = match self.core.current() {
            Ok(current) => current,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };

        let core = Arc::clone(&self.core);
        let max = self.core.config.buffer_size;
        self.core.handle.spawn(async move {
            loop {
                let read = tokio::select! {
                    biased;
                    _ = scope.cancelled() => {
                        callback(Err(NetError::not_connected("receive cancelled by disconnect")));
                        return;
                    }
                    read = Arc::clone(&active.link).read_chunk(max) => read,
                };

                match read {
                    Ok(bytes) => callback(Ok(bytes)),
                    Err(e) => {
                        core.fail_link(active.id);
                        callback(Err(NetError::from_receive(&e)));
                        return;
                    }
                }
            }
        });
    }

    /// Close the connection and cancel reconnects. Idempotent.
    pub fn disconnect(&self) -> NetResult<()> {
        let result = self.core.disconnect();
        debug!("Session {} disconnected", self.core.config.address);
        result
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("address", &self.core.config.address)
            .field("protocol", &self.core.config.protocol)
            .field("execution_model", &self.core.config.execution_model)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = self.core.disconnect();
        self.event_loop.shutdown();
    }
}
