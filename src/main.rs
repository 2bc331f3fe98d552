//! netbridge - TCP/UDP transport bridge
//!
//! `serve` runs an echo (or uppercase) server on top of [`ServerListener`];
//! `send` pushes one message through a [`ClientSession`] and prints the reply.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netbridge::config::{parse_execution_model, parse_protocol, ConfigManager};
use netbridge::shutdown::ShutdownAwareTask;
use netbridge::{
    ClientConfig, ClientSession, ExecutionModel, Protocol, ServerCallbacks, ServerConfig, ServerListener,
    ShutdownCoordinator,
};

/// CLI arguments for netbridge
#[derive(Parser, Debug)]
#[command(name = "netbridge")]
#[command(about = "netbridge - TCP/UDP client and server over one transport layer")]
#[command(version)]
#[command(long_about = "
netbridge - TCP/UDP client and server over one transport layer

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  NETBRIDGE_CLIENT_HOST        - Host the client connects to (IP literal or localhost)
  NETBRIDGE_CLIENT_PORT        - Port the client connects to
  NETBRIDGE_INITIAL_BACKOFF    - First reconnect delay (e.g., 1s, 500ms)
  NETBRIDGE_MAX_BACKOFF        - Reconnect delay cap (e.g., 30s)
  NETBRIDGE_MAX_RETRIES        - Reconnect attempts, -1 for unlimited
  NETBRIDGE_SERVER_PORT        - Port the server listens on
  NETBRIDGE_SERVER_MODEL       - Server execution model (event_loop, blocking)
  NETBRIDGE_PROTOCOL           - tcp or udp, for client and server
  NETBRIDGE_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "netbridge.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo server
    Serve {
        /// Port to listen on (0 picks a free port)
        #[arg(short, long)]
        port: Option<u16>,

        /// tcp or udp
        #[arg(long, value_parser = parse_protocol)]
        protocol: Option<Protocol>,

        /// event_loop or blocking
        #[arg(long, value_parser = parse_execution_model)]
        model: Option<ExecutionModel>,

        /// Buffer size in bytes
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Reply in upper case instead of echoing verbatim
        #[arg(long)]
        uppercase: bool,

        /// How often to log listener statistics
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        stats_interval: Duration,

        /// Deadline for closing all connections on shutdown
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        shutdown_timeout: Duration,
    },

    /// Send one message and print the reply
    Send {
        /// Server host (IP literal or localhost)
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// tcp or udp
        #[arg(long, value_parser = parse_protocol)]
        protocol: Option<Protocol>,

        /// event_loop or blocking
        #[arg(long, value_parser = parse_execution_model)]
        model: Option<ExecutionModel>,

        /// How long to wait for a reply
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        wait: Duration,

        /// Payload to send
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting netbridge v{}", env!("CARGO_PKG_VERSION"));

    // Priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    match args.command {
        Command::Serve {
            port,
            protocol,
            model,
            buffer_size,
            uppercase,
            stats_interval,
            shutdown_timeout,
        } => {
            config.merge_with_cli_args(port, protocol, model, buffer_size);
            config
                .validate()
                .context("Final configuration validation failed")?;

            if args.validate_config {
                log_server_summary(&config.server);
                return Ok(());
            }

            run_server(config.server, uppercase, stats_interval, shutdown_timeout).await
        }
        Command::Send {
            host,
            port,
            protocol,
            model,
            wait,
            message,
        } => {
            if let Some(host) = host {
                config.client.address.host = host;
            }
            config.merge_with_cli_args(port, protocol, model, None);
            config
                .validate()
                .context("Final configuration validation failed")?;

            if args.validate_config {
                info!("Configuration is valid, client target {}", config.client.address);
                return Ok(());
            }

            let client = config.client;
            tokio::task::spawn_blocking(move || run_client(client, &message, wait))
                .await
                .context("Client task failed")?
        }
    }
}

fn log_server_summary(config: &ServerConfig) {
    info!("Configuration is valid");
    info!("  Bind address: {}", config.bind_addr());
    info!("  Protocol: {:?}", config.protocol);
    info!("  Execution model: {:?}", config.execution_model);
    info!("  Buffer size: {} bytes", config.buffer_size);
}

async fn run_server(
    config: ServerConfig,
    uppercase: bool,
    stats_interval: Duration,
    shutdown_timeout: Duration,
) -> Result<()> {
    let listener = Arc::new(ServerListener::new());
    let sender = listener.sender();

    let callbacks = ServerCallbacks::new()
        .on_connect(|id, remote| info!("Client {} connected from {}", id, remote))
        .on_disconnect(|id, remote| info!("Client {} ({}) disconnected", id, remote))
        .on_receive(move |id, remote, data| {
            let reply = if uppercase {
                data.to_ascii_uppercase()
            } else {
                data.to_vec()
            };
            if let Err(e) = sender.send(id, &reply) {
                warn!("Reply to client {} ({}) failed: {}", id, remote, e);
            }
        });

    let protocol = config.protocol;
    let model = config.execution_model;
    listener
        .listen(config, callbacks)
        .context("Failed to start listener")?;

    if let Some(addr) = listener.local_addr() {
        info!("netbridge serving {:?} on {} ({:?} model)", protocol, addr, model);
    }
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let shutdown_coordinator = ShutdownCoordinator::new(shutdown_timeout);

    let reporter_listener = Arc::clone(&listener);
    let reporter = ShutdownAwareTask::spawn(&shutdown_coordinator, "stats-reporter", move |mut shutdown_rx| async move {
        let mut interval = tokio::time::interval(stats_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = reporter_listener.stats();
                    info!(
                        "Stats - active: {}, total: {}, received: {} bytes, sent: {} bytes",
                        stats.active_connections, stats.total_connections, stats.bytes_received, stats.bytes_sent
                    );
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    shutdown_coordinator.listen_for_signals().await?;
    reporter.wait_for_completion_or_shutdown().await?;

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.shutdown_listener(listener).await?;
    info!("Server shutdown complete");

    Ok(())
}

fn run_client(config: ClientConfig, message: &str, wait: Duration) -> Result<()> {
    let session = ClientSession::new(config).context("Failed to create client session")?;
    session
        .connect()
        .with_context(|| format!("Failed to connect to {}", session.description()))?;

    let (tx, rx) = mpsc::channel();
    session.receive_async(move |result| {
        let _ = tx.send(result);
    });

    session
        .send_sync(message.as_bytes())
        .with_context(|| format!("Failed to send to {}", session.description()))?;

    match rx.recv_timeout(wait) {
        Ok(Ok(reply)) => println!("{}", String::from_utf8_lossy(&reply)),
        Ok(Err(e)) => bail!("Failed to receive reply: {}", e),
        Err(_) => warn!("No reply from {} within {:?}", session.description(), wait),
    }

    session.disconnect()?;
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
