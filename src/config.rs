//! Configuration module for the quic-demo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::orchestrator::{BindSet, TransportMode};
use crate::transport::tls::TlsFiles;
use crate::transport::TransportSettings;

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "quic-demo-server")]
#[command(version)]
#[command(about = "QUIC demo server: synthetic payloads, upload hashing, static files", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Comma-separated bind addresses, e.g. 10.10.10.254:6121,tcp://[::1]:6122
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Path to directory containing static content
    #[arg(long)]
    pub www: Option<PathBuf>,

    /// Serve unprefixed bind addresses over TCP+TLS instead of QUIC
    #[arg(long)]
    pub tcp: bool,

    /// Path to TLS certificate file (required with --key)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to TLS key file (required with --cert)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Maximum number of requests served at once
    #[arg(long)]
    pub max_concurrent_requests: Option<usize>,

    /// Seconds allowed for a request head to arrive
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Addresses to bind to
    #[serde(default)]
    pub bind: Vec<String>,
    /// Static content root
    pub www: Option<PathBuf>,
    /// Serve unprefixed binds over TCP+TLS
    #[serde(default)]
    pub tcp: bool,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// UDP socket receive buffer, in bytes
    pub udp_recv_buffer: Option<usize>,
    /// UDP socket send buffer, in bytes
    pub udp_send_buffer: Option<usize>,
    #[serde(default = "default_backlog")]
    pub tcp_backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Vec::new(),
            www: None,
            tcp: false,
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            udp_recv_buffer: None,
            udp_send_buffer: None,
            tcp_backlog: default_backlog(),
        }
    }
}

/// TLS certificate/key pair
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_max_concurrent_requests() -> usize {
    10_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_backlog() -> i32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub binds: BindSet,
    pub www: Option<PathBuf>,
    /// `None` means an ephemeral self-signed certificate.
    pub tls: Option<TlsFiles>,
    pub transport: TransportSettings,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let default_mode = if cli.tcp || toml_config.server.tcp {
            TransportMode::Tcp
        } else {
            TransportMode::Quic
        };

        let binds = match cli.bind {
            Some(list) => BindSet::parse(&list, default_mode)?,
            None => BindSet::from_entries(&toml_config.server.bind, default_mode)?,
        };

        let cert = cli.cert.or(toml_config.tls.cert);
        let key = cli.key.or(toml_config.tls.key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTlsPair),
        };

        let www = cli
            .www
            .or(toml_config.server.www.clone())
            .filter(|p| !p.as_os_str().is_empty());

        let server = toml_config.server;
        let transport = TransportSettings {
            max_concurrent_requests: cli
                .max_concurrent_requests
                .unwrap_or(server.max_concurrent_requests),
            request_timeout: Duration::from_secs(
                cli.request_timeout_secs
                    .unwrap_or(server.request_timeout_secs),
            ),
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            udp_recv_buffer: server.udp_recv_buffer,
            udp_send_buffer: server.udp_send_buffer,
            tcp_backlog: server.tcp_backlog,
        };

        Ok(Config {
            binds,
            www,
            tls,
            transport,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_file: cli.log_file.or(toml_config.logging.file),
        })
    }
}
