//! Configuration system for NodeMesh
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/nodemesh/config.toml
//! - Linux: ~/.config/nodemesh/config.toml
//! - Windows: %APPDATA%/nodemesh/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{NodeInfo, PortForwarding};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Identity of the local node
    pub node: NodeConfig,
    /// Registry and link settings
    pub mesh: MeshConfig,
    /// Link reconnection settings
    pub reconnect: ReconnectConfig,
    /// Tunnel session settings
    pub tunnel: TunnelConfig,
    /// Node descriptors provisioned ahead of registration (credentials)
    pub nodes: Vec<NodeInfo>,
    /// Port-forward rules
    pub forwards: Vec<PortForwarding>,
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id (stable across restarts)
    pub id: String,
    /// Display name
    pub name: String,
    /// Parent node id, empty for the root
    pub parent_id: String,
    /// Bind address for the link listener
    pub bind: IpAddr,
    /// Link listener port
    pub port: u16,
    /// Shared secret a parent must present to link with this node
    pub token: String,
    /// Address advertised to the parent
    pub advertise_address: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "root".into(),
            name: "root".into(),
            parent_id: String::new(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 21090,
            token: String::new(),
            advertise_address: None,
        }
    }
}

impl NodeConfig {
    /// The local node's own registry record
    pub fn to_node_info(&self) -> NodeInfo {
        let address = self
            .advertise_address
            .clone()
            .unwrap_or_else(|| self.bind.to_string());
        NodeInfo::new(self.id.clone(), self.parent_id.clone(), self.token.clone())
            .with_name(self.name.clone())
            .with_address(address, self.port)
    }
}

/// Registry and link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Per-child send timeout during propagation (milliseconds)
    pub send_timeout_ms: u64,
    /// Handshake timeout (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Queue depth of each link's outbound channel
    pub link_queue: usize,
    /// Keep-alive ping interval on idle links (seconds)
    pub keepalive_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 3_000,
            handshake_timeout_ms: 5_000,
            link_queue: 256,
            keepalive_secs: 15,
        }
    }
}

impl MeshConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    pub enabled: bool,
    /// Initial delay before first reconnect attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts (milliseconds)
    pub max_delay_ms: u64,
    /// Maximum number of reconnection attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 0, // Unlimited
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before attempt `attempt` (1-based), doubling up to the max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay()
            .saturating_mul(1u32 << shift)
            .min(self.max_delay())
    }
}

/// Tunnel session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Frames a sender may have in flight per session
    pub window: u32,
    /// Maximum payload bytes per data frame
    pub max_frame_size: usize,
    /// Time to wait for the target to accept a session (milliseconds)
    pub open_timeout_ms: u64,
    /// A session with no traffic for this long reports Idle (milliseconds)
    pub idle_after_ms: u64,
    /// Close sessions idle for this long (seconds, 0 = never)
    pub session_idle_timeout_secs: u64,
    /// Discard chunked uploads idle for this long (seconds)
    pub upload_idle_timeout_secs: u64,
    /// Reaper sweep interval (seconds)
    pub sweep_interval_secs: u64,
    /// Shell used by terminal sessions when the request names none
    pub default_shell: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            window: 32,
            max_frame_size: 64 * 1024,
            open_timeout_ms: 10_000,
            idle_after_ms: 5_000,
            session_idle_timeout_secs: 0,
            upload_idle_timeout_secs: 300, // 5 minutes
            sweep_interval_secs: 30,
            default_shell: if cfg!(windows) { "cmd.exe" } else { "/bin/sh" }.into(),
        }
    }
}

impl TunnelConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.session_idle_timeout_secs))
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::Invalid("node.id must not be empty".into()));
        }
        if self.tunnel.window == 0 {
            return Err(ConfigError::Invalid("tunnel.window must be positive".into()));
        }
        if self.tunnel.max_frame_size == 0 || self.tunnel.max_frame_size > crate::MAX_FRAME_PAYLOAD
        {
            return Err(ConfigError::Invalid(format!(
                "tunnel.max_frame_size must be in 1..={}",
                crate::MAX_FRAME_PAYLOAD
            )));
        }
        if let Some(node) = self.nodes.iter().find(|n| n.id.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "provisioned node without id: {}",
                node.descriptor()
            )));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "nodemesh", "nodemesh")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let mut config = Self::default();
        config.node.token = "change-me".into();
        config.nodes.push(
            NodeInfo::new("edge-1", "root", "edge-1-token")
                .with_name("edge-1")
                .with_address("10.0.0.2", 21090),
        );
        config.forwards.push(PortForwarding {
            in_node: "root".into(),
            in_port: 2222,
            out_node: "edge-1".into(),
            out_port: 22,
        });
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// Semantically invalid values
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
