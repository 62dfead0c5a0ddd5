//! Configuration system for murmur.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MURMUR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/murmur/config.toml
//!   3. ~/.config/murmur/config.toml

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MurmurConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port for mutual-TLS message streams. 0 = OS-assigned.
    pub secure_port: u16,
    /// TCP port for the greet handshake. 0 = OS-assigned.
    pub greet_port: u16,
    /// HTTP port for /healthcheck. 0 = OS-assigned.
    pub health_port: u16,
    /// Address all listeners bind to.
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// IPv4 multicast group. Empty disables IPv4 multicast discovery.
    pub udp4_group: String,
    /// IPv6 multicast group. Empty disables IPv6 multicast discovery.
    pub udp6_group: String,
    /// UDP port shared by both families.
    pub port: u16,
    /// Broadcast interval in milliseconds.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub enabled: bool,
    /// Consul agent, as host:port.
    pub address: String,
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
    /// Address registered in the catalog. Empty = first non-loopback IPv4.
    pub advertise_addr: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            secure_port: 30000,
            greet_port: 30001,
            health_port: 30003,
            bind_addr: "0.0.0.0".into(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            udp4_group: "239.255.255.250".into(),
            udp6_group: "ff02::114".into(),
            port: 30002,
            interval_ms: 1000,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "consul:8500".into(),
            interval_ms: 1000,
            advertise_addr: String::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl CatalogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("murmur")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
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
    #[error("invalid bind address {0:?}")]
    BadBindAddr(String),
    #[error("port {0} is configured for more than one listener")]
    DuplicatePort(u16),
    #[error("{0} interval must be non-zero")]
    ZeroInterval(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MurmurConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MurmurConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MURMUR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MurmurConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MURMUR_* overrides. `lookup` is `std::env::var` in
    /// production; tests pass a map.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let port = |key: &str| lookup(key).and_then(|v| v.parse::<u16>().ok());

        if let Some(p) = port("MURMUR_NETWORK__SECURE_PORT") {
            self.network.secure_port = p;
        }
        if let Some(p) = port("MURMUR_NETWORK__GREET_PORT") {
            self.network.greet_port = p;
        }
        if let Some(p) = port("MURMUR_NETWORK__HEALTH_PORT") {
            self.network.health_port = p;
        }
        if let Some(v) = lookup("MURMUR_DISCOVERY__UDP4_GROUP") {
            self.discovery.udp4_group = v;
        }
        if let Some(v) = lookup("MURMUR_DISCOVERY__UDP6_GROUP") {
            self.discovery.udp6_group = v;
        }
        if let Some(p) = port("MURMUR_DISCOVERY__PORT") {
            self.discovery.port = p;
        }
        if let Some(v) = lookup("MURMUR_CATALOG__ENABLED") {
            self.catalog.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("MURMUR_CATALOG__ADDRESS") {
            self.catalog.address = v;
        }
    }

    /// Reject configurations the daemon cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;

        let ports = [
            self.network.secure_port,
            self.network.greet_port,
            self.network.health_port,
        ];
        for (i, p) in ports.iter().enumerate() {
            if *p != 0 && ports[i + 1..].contains(p) {
                return Err(ConfigError::DuplicatePort(*p));
            }
        }

        if self.discovery.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("discovery"));
        }
        if self.catalog.enabled && self.catalog.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("catalog"));
        }
        Ok(())
    }

    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.network
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::BadBindAddr(self.network.bind_addr.clone()))
    }
}
