//! Configuration Manager

use super::{ClientConfig, Config, ExecutionModel, Protocol};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NETBRIDGE_*` environment overrides
    pub fn apply_env(config: &mut Config) -> Result<()> {
        if let Ok(host) = std::env::var("NETBRIDGE_CLIENT_HOST") {
            config.client.address.host = host;
        }

        if let Ok(port) = std::env::var("NETBRIDGE_CLIENT_PORT") {
            config.client.address.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid NETBRIDGE_CLIENT_PORT: {}", port))?;
        }

        if let Ok(backoff) = std::env::var("NETBRIDGE_INITIAL_BACKOFF") {
            config.client.auto_reconnect.initial_backoff = humantime::parse_duration(&backoff)
                .with_context(|| format!("Invalid NETBRIDGE_INITIAL_BACKOFF: {}", backoff))?;
        }

        if let Ok(backoff) = std::env::var("NETBRIDGE_MAX_BACKOFF") {
            config.client.auto_reconnect.max_backoff = humantime::parse_duration(&backoff)
                .with_context(|| format!("Invalid NETBRIDGE_MAX_BACKOFF: {}", backoff))?;
        }

        if let Ok(retries) = std::env::var("NETBRIDGE_MAX_RETRIES") {
            config.client.auto_reconnect.max_retries = retries
                .parse::<i64>()
                .with_context(|| format!("Invalid NETBRIDGE_MAX_RETRIES: {}", retries))?;
        }

        if let Ok(port) = std::env::var("NETBRIDGE_SERVER_PORT") {
            config.server.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid NETBRIDGE_SERVER_PORT: {}", port))?;
        }

        if let Ok(model) = std::env::var("NETBRIDGE_SERVER_MODEL") {
            config.server.execution_model = parse_execution_model(&model)?;
        }

        if let Ok(protocol) = std::env::var("NETBRIDGE_PROTOCOL") {
            let protocol = parse_protocol(&protocol)?;
            config.server.protocol = protocol;
            config.client.protocol = protocol;
        }

        if let Ok(log_level) = std::env::var("NETBRIDGE_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(())
    }
}

/// Parse `tcp` / `udp`
pub fn parse_protocol(value: &str) -> Result<Protocol> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => bail!("protocol must be 'tcp' or 'udp', got '{}'", other),
    }
}

/// Parse `event_loop` / `blocking`
pub fn parse_execution_model(value: &str) -> Result<ExecutionModel> {
    match value.to_ascii_lowercase().replace('-', "_").as_str() {
        "event_loop" => Ok(ExecutionModel::EventLoop),
        "blocking" => Ok(ExecutionModel::Blocking),
        other => bail!(
            "execution model must be 'event_loop' or 'blocking', got '{}'",
            other
        ),
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_client_config()
            .with_context(|| "Client configuration validation failed")?;

        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    /// Validate client configuration
    fn validate_client_config(&self) -> Result<()> {
        self.client.validate()
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.poll_interval.as_millis() < 10 {
            bail!("poll_interval must be at least 10ms");
        }

        if self.server.poll_interval.as_millis() > 1000 {
            bail!("poll_interval cannot exceed 1s, shutdown would become unresponsive");
        }

        if self.server.send_retry_limit == 0 {
            bail!("send_retry_limit must be greater than 0");
        }

        validate_buffer_size(self.server.buffer_size)
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        port: Option<u16>,
        protocol: Option<Protocol>,
        execution_model: Option<ExecutionModel>,
        buffer_size: Option<usize>,
    ) {
        if let Some(port) = port {
            self.server.port = port;
            self.client.address.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(protocol) = protocol {
            self.server.protocol = protocol;
            self.client.protocol = protocol;
            tracing::info!("CLI override: protocol set to {:?}", protocol);
        }

        if let Some(model) = execution_model {
            self.server.execution_model = model;
            self.client.execution_model = model;
            tracing::info!("CLI override: execution model set to {:?}", model);
        }

        if let Some(buffer_size) = buffer_size {
            self.server.buffer_size = buffer_size;
            self.client.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }
    }
}

impl ClientConfig {
    /// Check the session settings; the address is only checked on connect
    pub fn validate(&self) -> Result<()> {
        let reconnect = &self.auto_reconnect;

        if reconnect.initial_backoff.is_zero() {
            bail!("auto_reconnect.initial_backoff must be greater than 0");
        }

        if reconnect.max_backoff < reconnect.initial_backoff {
            bail!("auto_reconnect.max_backoff must not be smaller than initial_backoff");
        }

        if reconnect.max_retries < -1 {
            bail!("auto_reconnect.max_retries must be -1 (unlimited) or a non-negative count");
        }

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        validate_buffer_size(self.buffer_size)
    }
}

fn validate_buffer_size(buffer_size: usize) -> Result<()> {
    if buffer_size < 1024 {
        bail!("buffer_size must be at least 1024 bytes");
    }

    if buffer_size > 1048576 {
        bail!("buffer_size cannot exceed 1MB");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.client.auto_reconnect.initial_backoff = Duration::from_secs(10);
        config.client.auto_reconnect.max_backoff = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_buffer_and_retries() {
        let mut config = Config::default();
        config.server.buffer_size = 512;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.auto_reconnect.max_retries = -5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.poll_interval = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
protocol = "udp"
execution_model = "blocking"
keep_alive = false

[client.address]
host = "10.0.0.5"
port = 9100

[client.auto_reconnect]
initial_backoff = "500ms"
max_backoff = "8s"
max_retries = 4

[server]
port = 9200
poll_interval = "150ms"

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.client.protocol, Protocol::Udp);
        assert_eq!(config.client.execution_model, ExecutionModel::Blocking);
        assert_eq!(config.client.address.port, 9100);
        assert_eq!(
            config.client.auto_reconnect.initial_backoff,
            Duration::from_millis(500)
        );
        assert_eq!(config.client.auto_reconnect.max_retries, 4);
        assert!(!config.client.keep_alive);
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.server.poll_interval, Duration::from_millis(150));
        assert_eq!(config.server.execution_model, ExecutionModel::EventLoop);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, crate::config::ServerConfig::default().port);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_protocol("TCP").unwrap(), Protocol::Tcp);
        assert_eq!(parse_protocol("udp").unwrap(), Protocol::Udp);
        assert!(parse_protocol("sctp").is_err());
        assert_eq!(
            parse_execution_model("event-loop").unwrap(),
            ExecutionModel::EventLoop
        );
        assert_eq!(
            parse_execution_model("blocking").unwrap(),
            ExecutionModel::Blocking
        );
        assert!(parse_execution_model("threads").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some(9300),
            Some(Protocol::Udp),
            Some(ExecutionModel::Blocking),
            Some(8192),
        );
        assert_eq!(config.server.port, 9300);
        assert_eq!(config.client.address.port, 9300);
        assert_eq!(config.server.protocol, Protocol::Udp);
        assert_eq!(config.client.execution_model, ExecutionModel::Blocking);
        assert_eq!(config.server.buffer_size, 8192);
    }
}
