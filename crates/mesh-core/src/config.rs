//! Configuration for the mesh node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESH_CONFIG (explicit override)
//!   2. <data_dir>/config.toml is NOT consulted — the config names the
//!      data dir, not the other way around.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub network: NetworkConfig,
    pub channel: ChannelConfig,
}

/// Peer overlay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the peer acceptor binds. Empty = all interfaces.
    pub listen_ip: String,
    /// Peer TCP port. 0 = OS-assigned.
    pub listen_port: u16,
    /// Externally reachable address to publish instead of the listen
    /// address. Empty = publish the listen address.
    pub public_ip: String,
    /// Prefer the published public address when deciding what to announce.
    pub traverse_nat: bool,
    /// Only node ids on the required list may establish sessions.
    pub pin_mode: bool,
    /// Target peer count; ingress admission allows a multiple of this.
    pub ideal_peer_count: u32,
    /// TLS profile for the channel acceptor.
    pub ssl_mode: SslMode,
    /// Directory holding ca.crt, server.crt, server.key.
    pub data_dir: PathBuf,
}

/// SDK channel acceptor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub listen_ip: String,
    pub listen_port: u16,
}

/// Which TLS profile the channel acceptor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Key exchange pinned to the prime256v1 curve.
    V2,
    /// Standard server-authenticated TLS.
    Default,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_ip: String::new(),
            listen_port: 30300,
            public_ip: String::new(),
            traverse_nat: false,
            pin_mode: false,
            ideal_peer_count: 128,
            ssl_mode: SslMode::Default,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".into(),
            listen_port: 20200,
        }
    }
}

impl NetworkConfig {
    /// The configured listen address, or the wildcard when unset/invalid.
    pub fn listen_addr(&self) -> IpAddr {
        self.listen_ip
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn public_addr(&self) -> Option<IpAddr> {
        self.public_ip.parse().ok()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
                }
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESH_NETWORK__LISTEN_IP") {
            self.network.listen_ip = v;
        }
        if let Ok(v) = std::env::var("MESH_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("MESH_NETWORK__PIN_MODE") {
            self.network.pin_mode = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MESH_NETWORK__DATA_DIR") {
            self.network.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MESH_CHANNEL__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.channel.listen_port = p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MeshConfig::default();
        assert_eq!(config.network.listen_port, 30300);
        assert_eq!(config.channel.listen_port, 20200);
        assert!(!config.network.pin_mode);
        assert_eq!(config.network.ssl_mode, SslMode::Default);
        assert!(config.network.listen_addr().is_unspecified());
        assert!(config.network.public_addr().is_none());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = MeshConfig::default();
        config.network.pin_mode = true;
        config.network.ssl_mode = SslMode::V2;
        config.network.public_ip = "203.0.113.9".into();

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: MeshConfig = toml::from_str(&text).unwrap();
        assert!(parsed.network.pin_mode);
        assert_eq!(parsed.network.ssl_mode, SslMode::V2);
        assert_eq!(
            parsed.network.public_addr(),
            Some("203.0.113.9".parse().unwrap())
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: MeshConfig = toml::from_str("[network]\nlisten_port = 31000\n").unwrap();
        assert_eq!(parsed.network.listen_port, 31000);
        assert_eq!(parsed.channel.listen_port, 20200);
    }
}
