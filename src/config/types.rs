//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{ErrorKind, NetError, NetResult};

/// Default read chunk size for stream sockets
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Remote endpoint of a client session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address without touching DNS.
    ///
    /// Only IP literals and `localhost` are accepted.
    pub fn resolve(&self) -> NetResult<SocketAddr> {
        if self.port == 0 {
            return Err(NetError::new(
                ErrorKind::InvalidAddress,
                format!("port 0 is not a valid destination for {}", self),
            ));
        }

        let host = self.host.trim();
        let ip = if host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            host.trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| {
                    NetError::new(
                        ErrorKind::InvalidAddress,
                        format!("'{}' is not an IP address", self.host),
                    )
                })?
        };

        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Socket flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// How socket completions are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Single-threaded cooperative reactor
    #[default]
    EventLoop,
    /// Blocking sockets (client) or a readiness-polling worker thread (server)
    Blocking,
}

/// Automatic reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// -1 retries forever
    pub max_retries: i64,
}

impl ReconnectConfig {
    pub fn is_unlimited(&self) -> bool {
        self.max_retries < 0
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30000),
            max_retries: -1,
        }
    }
}

/// Client session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub address: Address,
    pub protocol: Protocol,
    pub execution_model: ExecutionModel,
    pub auto_reconnect: ReconnectConfig,
    pub keep_alive: bool,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub buffer_size: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            address: Address::new(host, port),
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_execution_model(mut self, model: ExecutionModel) -> Self {
        self.execution_model = model;
        self
    }

    pub fn with_reconnect(mut self, auto_reconnect: ReconnectConfig) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: Address::new("127.0.0.1", 7000),
            protocol: Protocol::Tcp,
            execution_model: ExecutionModel::EventLoop,
            auto_reconnect: ReconnectConfig::default(),
            keep_alive: true,
            connect_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Server listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub execution_model: ExecutionModel,
    /// Readiness polling tick of the blocking worker
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub buffer_size: usize,
    /// Would-block retries (1ms apart) before a send is declared failed
    pub send_retry_limit: u32,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_execution_model(mut self, model: ExecutionModel) -> Self {
        self.execution_model = model;
        self
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7000,
            protocol: Protocol::Tcp,
            execution_model: ExecutionModel::EventLoop,
            poll_interval: Duration::from_millis(100),
            buffer_size: DEFAULT_BUFFER_SIZE,
            send_retry_limit: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
