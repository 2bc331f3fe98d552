//! Event Loop
//!
//! A single-threaded cooperative reactor: one tokio `current_thread`
//! runtime driven on a dedicated OS thread. Every socket completion and
//! user callback scheduled on it runs serialized on that thread.

use std::future::Future;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{NetError, NetResult};

/// How long a stopping loop waits for blocking work (a std connect) to finish
const BLOCKING_GRACE: Duration = Duration::from_millis(250);

pub struct EventLoop {
    name: String,
    handle: Handle,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl EventLoop {
    /// Build the runtime and start driving it on its own thread
    pub fn start(name: &str) -> NetResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| NetError::internal(format!("failed to build event loop: {}", e)))?;

        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();
        let token = stop.clone();
        let loop_name = name.to_string();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Event loop {} running", loop_name);
                runtime.block_on(token.cancelled());
                // Cancels every task still parked on it; blocking work past the grace is abandoned.
                runtime.shutdown_timeout(BLOCKING_GRACE);
                debug!("Event loop {} stopped", loop_name);
            })
            .map_err(|e| NetError::internal(format!("failed to spawn event loop thread: {}", e)))?;

        let thread_id = thread.thread().id();

        Ok(Self {
            name: name.to_string(),
            handle,
            stop,
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// True when called from the loop's own thread (inside a callback)
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Run a future on the loop and block the calling thread until it completes.
    ///
    /// Fails instead of deadlocking when issued from the loop thread itself.
    pub fn block_on<F, T>(&self, future: F) -> NetResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return Err(NetError::internal(format!(
                "blocking call issued from event loop thread {}",
                self.name
            )));
        }

        if self.is_stopped() {
            return Err(NetError::internal(format!("event loop {} is stopped", self.name)));
        }

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });

        rx.recv()
            .map_err(|_| NetError::internal(format!("event loop {} stopped", self.name)))
    }

    /// Stop the loop and join its thread (skipped when called from the loop itself)
    pub fn shutdown(&self) {
        self.stop.cancel();

        if self.is_current() {
            return;
        }

        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Event loop {} thread panicked", self.name);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
