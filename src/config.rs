//! Configuration management
//!
//! All settings live in one TOML file. Every section has defaults, so a
//! minimal file only needs the `[passwords]` table.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::codec::mpeg::MAX_FRAME_LEN;
use crate::constants::*;
use crate::error::ConfigError;
use crate::protocol::StreamMetadata;

/// File name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "icy-relay.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    /// Pull audio from another ICY server instead of accepting a source
    pub relay: Option<RelayConfig>,
    pub passwords: PasswordConfig,
    pub admin: AdminConfig,
}

/// Listener sockets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    /// Playback port
    pub port: u16,
    /// Source port, `port + 1` when unset
    pub source_port: Option<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            source_port: None,
        }
    }
}

impl NetworkConfig {
    pub fn playback_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.bind_address, self.port)
    }

    pub fn source_addr(&self) -> Result<SocketAddr, ConfigError> {
        let port = match self.source_port {
            Some(port) => port,
            None => self
                .port
                .checked_add(1)
                .ok_or_else(|| ConfigError::Invalid("network.port leaves no room for the source port".into()))?,
        };
        socket_addr(&self.bind_address, port)
    }
}

/// Backlog and listener metadata settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Backlog capacity in bytes
    pub buffer_size: usize,
    /// Audio bytes between metadata blocks for listeners that want them
    pub meta_interval: usize,
    pub meta_override: MetaOverride,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            meta_interval: DEFAULT_META_INTERVAL,
            meta_override: MetaOverride::default(),
        }
    }
}

/// Station fields that win over whatever the source sends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaOverride {
    pub station_name: Option<String>,
    pub station_url: Option<String>,
    pub station_genre: Option<String>,
}

impl MetaOverride {
    pub fn apply(&self, metadata: &mut StreamMetadata) {
        if let Some(name) = &self.station_name {
            metadata.station_name = name.clone();
        }
        if let Some(url) = &self.station_url {
            metadata.station_url = url.clone();
        }
        if let Some(genre) = &self.station_genre {
            metadata.station_genre = genre.clone();
        }
    }
}

/// Upstream server to relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Delay before reconnecting after the upstream drops
    pub reconnect_delay_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: DEFAULT_PORT,
            path: "/".to_string(),
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    /// Password for sources
    pub dj: String,
    /// Password for the admin surface
    pub admin: String,
    /// Stop the admin password from working for sources
    pub strict_admin: bool,
}

/// Admin HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_ADMIN_PORT,
        }
    }
}

impl AdminConfig {
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.bind_address, self.port)
    }
}

impl AppConfig {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `icy-relay.toml` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "icy-relay").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// The active relay, if one is configured and enabled
    pub fn relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref().filter(|relay| relay.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passwords.dj.is_empty() {
            return Err(ConfigError::Invalid("passwords.dj must be set".into()));
        }
        if self.passwords.admin.is_empty() {
            return Err(ConfigError::Invalid("passwords.admin must be set".into()));
        }
        if self.stream.meta_interval == 0 {
            return Err(ConfigError::Invalid("stream.meta_interval must be positive".into()));
        }
        if self.stream.buffer_size < MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "stream.buffer_size must hold at least one frame ({} bytes)",
                MAX_FRAME_LEN
            )));
        }
        if let Some(relay) = self.relay() {
            if relay.host.is_empty() {
                return Err(ConfigError::Invalid("relay.host must be set when relay is enabled".into()));
            }
            if !relay.path.starts_with('/') {
                return Err(ConfigError::Invalid("relay.path must start with '/'".into()));
            }
        }

        self.network.playback_addr()?;
        self.network.source_addr()?;
        if self.admin.enabled {
            self.admin.addr()?;
        }
        Ok(())
    }
}

fn socket_addr(ip: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    ip.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ConfigError::Invalid(format!("invalid bind address {}", ip)))
}
