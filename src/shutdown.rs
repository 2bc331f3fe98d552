//! Graceful Shutdown Handling
//!
//! Signal handling for the `netbridge` binary. SIGTERM, SIGINT and Ctrl+C
//! are turned into one broadcast; the listener is then torn down on a
//! blocking thread with a deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::server::ServerListener;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Upper bound for tearing the listener down
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("No shutdown subscribers");
        }
    }

    /// Wait for SIGTERM/SIGINT (Ctrl+C elsewhere), then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Run `graceful_shutdown` off the async threads, bounded by the timeout
    pub async fn shutdown_listener(&self, listener: Arc<ServerListener>) -> Result<()> {
        let start_time = Instant::now();
        let active = listener.stats().active_connections;
        info!(
            "Closing listener with {} active connection(s) (timeout: {:?})",
            active, self.timeout
        );

        let task = tokio::task::spawn_blocking(move || listener.graceful_shutdown());

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(()))) => {
                info!("Listener closed gracefully in {:?}", start_time.elapsed());
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                warn!("Listener closed with errors: {}", e);
                Err(e.into())
            }
            Ok(Err(e)) => {
                error!("Shutdown task failed: {}", e);
                Err(anyhow::anyhow!("Shutdown task failed: {}", e))
            }
            Err(_) => {
                warn!("Shutdown timeout reached after {:?}", start_time.elapsed());
                Err(anyhow::anyhow!("Listener shutdown timed out"))
            }
        }
    }
}

/// Shutdown-aware task handle that can be gracefully cancelled
pub struct ShutdownAwareTask {
    handle: tokio::task::JoinHandle<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    pub fn spawn<F, Fut>(shutdown_coordinator: &ShutdownCoordinator, task_name: &str, task_fn: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let shutdown_rx = shutdown_coordinator.subscribe();
        let task_name = task_name.to_string();

        let handle = tokio::spawn(async move {
            debug!("Starting shutdown-aware task: {}", task_name);
            task_fn(shutdown_rx).await;
            debug!("Shutdown-aware task completed: {}", task_name);
        });

        Self {
            handle,
            shutdown_rx: shutdown_coordinator.subscribe(),
        }
    }

    /// Wait for the task to complete or shutdown signal
    pub async fn wait_for_completion_or_shutdown(mut self) -> Result<()> {
        tokio::select! {
            result = &mut self.handle => {
                match result {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_cancelled() => {
                        debug!("Task was cancelled");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Task failed: {}", e);
                        Err(anyhow::anyhow!("Task failed: {}", e))
                    }
                }
            }
            _ = self.shutdown_rx.recv() => {
                debug!("Received shutdown signal, cancelling task");
                self.handle.abort();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::ServerCallbacks;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_aware_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

        let task = ShutdownAwareTask::spawn(&coordinator, "test_task", |mut shutdown_rx| async move {
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => {}
                _ = shutdown_rx.recv() => {}
            }
        });

        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            coordinator.trigger();
        });

        assert!(task.wait_for_completion_or_shutdown().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_listener() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let listener = Arc::new(ServerListener::new());
        let config = ServerConfig::new(0).with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        listener.listen(config, ServerCallbacks::new()).unwrap();

        coordinator
            .shutdown_listener(Arc::clone(&listener))
            .await
            .unwrap();
        assert!(!listener.is_listening());
    }
}
