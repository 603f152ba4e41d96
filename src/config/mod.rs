//! Configuration module
//!
//! Handles loading and saving relaynet configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ByteOrder, RelayCodec, DEFAULT_MAX_COLLECTION_LEN, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Socket server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Socket client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Relay message settings
    #[serde(default)]
    pub relay: RelayConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Unique node identifier (auto-generated if not set)
    pub node_id: Option<String>,
    /// Human-readable name for this node
    #[serde(default = "default_name")]
    pub name: String,
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Zone stamped on messages this node originates
    #[serde(default)]
    pub zone: u16,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            name: default_name(),
            log_level: default_log_level(),
            zone: 0,
        }
    }
}

/// Socket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<IpAddr>,
    /// Seconds between connection health sweeps, 0 disables them
    #[serde(default = "default_check_interval")]
    pub connection_check_interval_secs: u64,
    /// Longest pause allowed inside a partially received frame
    #[serde(default = "default_socket_timeout")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_socket_buffer")]
    pub receive_buffer_size: u32,
    #[serde(default = "default_socket_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_socket_buffer")]
    pub send_buffer_size: u32,
    /// Starting size of per-connection receive buffers
    #[serde(default = "default_initial_message_size")]
    pub initial_message_size: usize,
    /// Frames larger than this are oversized
    #[serde(default = "default_maximum_message_size")]
    pub maximum_message_size: usize,
    /// Drop oversized frames as they arrive instead of reading them
    #[serde(default)]
    pub discard_too_big_messages: bool,
    #[serde(default = "default_queue_depth")]
    pub oneway_queue_depth: usize,
    #[serde(default = "default_queue_depth")]
    pub sync_queue_depth: usize,
    /// Oneway workers, 0 = two per core
    #[serde(default)]
    pub oneway_threads: usize,
    /// Sync workers, 0 = four per core
    #[serde(default)]
    pub sync_threads: usize,
    /// Uses before a pooled buffer is retired, 0 = unlimited
    #[serde(default)]
    pub buffer_pool_reuses: usize,
    /// Uses before a pooled receive buffer is retired, 0 = unlimited
    #[serde(default)]
    pub connection_state_reuses: usize,
    /// Big-endian frame headers
    #[serde(default)]
    pub use_network_order: bool,
    /// Connection limit, 0 = unlimited
    #[serde(default)]
    pub maximum_open_sockets: usize,
    /// Addresses always accepted
    #[serde(default)]
    pub whitelist: Vec<IpAddr>,
    /// Refuse and evict everything outside the whitelist
    #[serde(default)]
    pub whitelist_only: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_check_interval() -> u64 {
    120
}

fn default_socket_timeout() -> u64 {
    1000
}

fn default_socket_buffer() -> u32 {
    8192
}

fn default_initial_message_size() -> usize {
    8192
}

fn default_maximum_message_size() -> usize {
    20480
}

fn default_queue_depth() -> usize {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connection_check_interval_secs: default_check_interval(),
            receive_timeout_ms: default_socket_timeout(),
            receive_buffer_size: default_socket_buffer(),
            send_timeout_ms: default_socket_timeout(),
            send_buffer_size: default_socket_buffer(),
            initial_message_size: default_initial_message_size(),
            maximum_message_size: default_maximum_message_size(),
            discard_too_big_messages: false,
            oneway_queue_depth: default_queue_depth(),
            sync_queue_depth: default_queue_depth(),
            oneway_threads: 0,
            sync_threads: 0,
            buffer_pool_reuses: 0,
            connection_state_reuses: 0,
            use_network_order: false,
            maximum_open_sockets: 0,
            whitelist: Vec::new(),
            whitelist_only: false,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_network_flag(self.use_network_order)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.maximum_message_size < crate::protocol::ENVELOPE_SIZE {
            return Err(ConfigError::Invalid {
                field: "maximum_message_size",
                reason: format!("must be at least {}", crate::protocol::ENVELOPE_SIZE),
            });
        }
        if self.initial_message_size == 0 {
            return Err(ConfigError::Invalid {
                field: "initial_message_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.oneway_queue_depth == 0 || self.sync_queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_depth",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Socket client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_timeout")]
    pub connect_timeout_ms: u64,
    /// Longest wait for a reply
    #[serde(default = "default_client_timeout")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_client_timeout")]
    pub send_timeout_ms: u64,
    /// Big-endian frame headers
    #[serde(default)]
    pub use_network_order: bool,
    /// Largest reply payload accepted
    #[serde(default = "default_maximum_message_size")]
    pub maximum_reply_message_size: usize,
}

fn default_client_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_client_timeout(),
            receive_timeout_ms: default_client_timeout(),
            send_timeout_ms: default_client_timeout(),
            use_network_order: false,
            maximum_reply_message_size: default_maximum_message_size(),
        }
    }
}

impl ClientConfig {
    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_network_flag(self.use_network_order)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Relay message serialization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Mark outgoing messages for legacy peers
    #[serde(default)]
    pub legacy_serialization: bool,
    /// Write nested objects with a type header
    #[serde(default)]
    pub write_type_header: bool,
    /// Largest message list accepted when decoding
    #[serde(default = "default_max_collection_len")]
    pub max_collection_len: usize,
}

fn default_max_collection_len() -> usize {
    DEFAULT_MAX_COLLECTION_LEN
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            legacy_serialization: false,
            write_type_header: false,
            max_collection_len: default_max_collection_len(),
        }
    }
}

impl RelayConfig {
    pub fn codec(&self) -> RelayCodec {
        RelayCodec::new(self.write_type_header, self.max_collection_len)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.server.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("relaynet/config.toml")),
            Some(PathBuf::from("./relaynet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the node ID, generating one if not set
    pub fn node_id(&self) -> String {
        self.general
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            node_id: Some("relay-node-01".to_string()),
            name: "Relay Node".to_string(),
            log_level: default_log_level(),
            zone: 1,
        },
        server: ServerConfig {
            whitelist: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
