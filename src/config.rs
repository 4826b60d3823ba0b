//! Configuration module for the ring-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// How received bytes make their way back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EchoMode {
    /// Chunks wait in the ring until the flush timer writes them.
    #[default]
    Buffered,
    /// Chunks are written back as soon as they are read.
    Immediate,
}

/// What to do with a new chunk when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the incoming chunk.
    #[default]
    RejectNewest,
    /// Drop the oldest buffered chunk to make room.
    EvictOldest,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "ring-echo")]
#[command(version)]
#[command(about = "TCP echo server with a bounded, timer-flushed ring buffer", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Echo mode
    #[arg(long, value_enum)]
    pub mode: Option<EchoMode>,

    /// Ring buffer capacity in chunks
    #[arg(short = 'n', long)]
    pub capacity: Option<usize>,

    /// Flush timer period in milliseconds
    #[arg(short = 'f', long)]
    pub flush_interval_ms: Option<u64>,

    /// Maximum bytes per chunk (read buffer size)
    #[arg(long)]
    pub max_chunk_len: Option<usize>,

    /// Policy when a chunk arrives and the ring is full
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub mode: EchoMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            mode: EchoMode::default(),
        }
    }
}

/// Per-connection ring buffer settings
#[derive(Debug, Deserialize)]
pub struct RingConfig {
    /// Number of chunk slots
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Flush timer period in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Largest chunk a single read can produce
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            max_chunk_len: default_max_chunk_len(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Out-of-band control settings
#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    /// First payload byte that stops the server
    #[serde(default = "default_sentinel")]
    pub sentinel: char,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sentinel: default_sentinel(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_backlog() -> i32 {
    128
}

fn default_max_connections() -> usize {
    1024
}

fn default_capacity() -> usize {
    16
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_max_chunk_len() -> usize {
    64 * 1024 // 64 KB
}

fn default_sentinel() -> char {
    'z'
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub max_connections: usize,
    pub mode: EchoMode,
    pub capacity: usize,
    pub flush_interval: Duration,
    pub max_chunk_len: usize,
    pub overflow: OverflowPolicy,
    pub sentinel: u8,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], default_port())),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            mode: EchoMode::default(),
            capacity: default_capacity(),
            flush_interval: Duration::from_millis(default_flush_interval_ms()),
            max_chunk_len: default_max_chunk_len(),
            overflow: OverflowPolicy::default(),
            sentinel: default_sentinel() as u8,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let host = cli.host.unwrap_or(toml_config.server.host);
        let port = cli.port.unwrap_or(toml_config.server.port);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::Invalid("host", format!("'{host}' is not an IP address")))?;

        let backlog = cli.backlog.unwrap_or(toml_config.server.backlog);
        if backlog <= 0 {
            return Err(ConfigError::Invalid("backlog", "must be positive".into()));
        }

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections",
                "must be at least 1".into(),
            ));
        }

        let capacity = cli.capacity.unwrap_or(toml_config.ring.capacity);
        if capacity == 0 {
            return Err(ConfigError::Invalid(
                "capacity",
                crate::ring::RingError::InvalidCapacity.to_string(),
            ));
        }

        let flush_interval_ms = cli
            .flush_interval_ms
            .unwrap_or(toml_config.ring.flush_interval_ms);
        if flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_ms",
                "must be at least 1".into(),
            ));
        }

        let max_chunk_len = cli.max_chunk_len.unwrap_or(toml_config.ring.max_chunk_len);
        if max_chunk_len == 0 {
            return Err(ConfigError::Invalid(
                "max_chunk_len",
                "must be at least 1".into(),
            ));
        }

        let sentinel = toml_config.control.sentinel;
        if !sentinel.is_ascii() {
            return Err(ConfigError::Invalid(
                "sentinel",
                format!("'{sentinel}' is not a single ASCII character"),
            ));
        }

        Ok(Config {
            listen: SocketAddr::new(ip, port),
            backlog,
            max_connections,
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            capacity,
            flush_interval: Duration::from_millis(flush_interval_ms),
            max_chunk_len,
            overflow: cli.overflow.unwrap_or(toml_config.ring.overflow),
            sentinel: sentinel as u8,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["ring-echo"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.mode, EchoMode::Buffered);
        assert_eq!(config.ring.flush_interval_ms, 2000);
        assert_eq!(config.ring.overflow, OverflowPolicy::RejectNewest);
        assert_eq!(config.control.sentinel, 'z');
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 4000
            mode = "immediate"

            [ring]
            capacity = 3
            flush_interval_ms = 500
            max_chunk_len = 1024
            overflow = "evict-oldest"

            [control]
            sentinel = "q"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.mode, EchoMode::Immediate);
        assert_eq!(config.ring.capacity, 3);
        assert_eq!(config.ring.flush_interval_ms, 500);
        assert_eq!(config.ring.max_chunk_len, 1024);
        assert_eq!(config.ring.overflow, OverflowPolicy::EvictOldest);
        assert_eq!(config.control.sentinel, 'q');
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_merge_defaults() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.capacity, 16);
        assert_eq!(config.flush_interval, Duration::from_millis(2000));
        assert_eq!(config.sentinel, b'z');
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 4000
            [ring]
            capacity = 8
            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--port", "5000", "-n", "2", "--mode", "immediate"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.capacity, 2);
        assert_eq!(config.mode, EchoMode::Immediate);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Config::merge(cli(&["--capacity", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("capacity", _)));
    }

    #[test]
    fn test_invalid_host_rejected() {
        let err = Config::merge(cli(&["--host", "localhost"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("host", _)));
    }

    #[test]
    fn test_non_ascii_sentinel_rejected() {
        let toml_config: TomlConfig = toml::from_str("[control]\nsentinel = \"é\"\n").unwrap();
        let err = Config::merge(cli(&[]), toml_config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("sentinel", _)));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_cli(cli(&["--config", "/nonexistent/ring-echo.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(_, _)));
    }
}
