//! Configuration for the echo server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Which process entry point to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Bind, listen, echo until signaled.
    Server,
    /// Open N connections, send the payload list, exit when all close.
    Client,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echoplex")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP echo server and client", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind (server) or connect to (client)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server until interrupted
    Server {
        /// Maximum number of simultaneous peer connections
        #[arg(long)]
        max_connections: Option<usize>,
    },
    /// Run the echo client and exit once every connection has closed
    Client {
        /// Number of concurrent connections to open
        #[arg(short = 'n', long)]
        connections: Option<usize>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint shared by both roles
#[derive(Debug, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Server-side configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// Client-side configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_connections")]
    pub connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections: default_client_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    56123
}

fn default_max_connections() -> usize {
    1024
}

fn default_client_connections() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let (mode, max_connections, connections) = match cli.command {
            Command::Server { max_connections } => (
                Mode::Server,
                max_connections.unwrap_or(toml_config.server.max_connections),
                toml_config.client.connections,
            ),
            Command::Client { connections } => (
                Mode::Client,
                toml_config.server.max_connections,
                connections.unwrap_or(toml_config.client.connections),
            ),
        };

        Ok(Config {
            mode,
            host: cli.host.unwrap_or(toml_config.net.host),
            port: cli.port.unwrap_or(toml_config.net.port),
            max_connections,
            connections,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Endpoint string for bind/connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
