//! Controller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/udrone/controller.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else defaults: the multicast endpoint falls back to the fixed
//! protocol address, and the source interface address is optional (but
//! drones must be able to reach the controller via unicast, so leaving it
//! unset only works when the OS default route faces the test LAN).

use crate::host::HostConfig;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Multicast endpoint the drones listen on.
    pub multicast_addr: SocketAddr,
    /// Local address used as the outgoing multicast interface; None means
    /// the OS picks.
    pub source_addr: Option<Ipv4Addr>,
}

impl ControllerConfig {
    /// Engine knobs derived from this config.
    #[must_use]
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            multicast_addr: self.network.multicast_addr,
            source_addr: self.network.source_addr,
            ..HostConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    network: Option<RawNetworkConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNetworkConfig {
    multicast_addr: Option<String>,
    source_addr: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load controller config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load controller config from the default path `/etc/udrone/controller.toml`.
pub fn load_config() -> Result<ControllerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/udrone/controller.toml"))
}

/// Load controller config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ControllerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    // Network defaults
    let network = match raw.network {
        Some(n) => {
            let multicast_addr = match n.multicast_addr {
                Some(s) => s.parse::<SocketAddr>().map_err(|_| {
                    ConfigError::InvalidValue(format!("invalid multicast_addr: '{s}'"))
                })?,
                None => SocketAddr::V4(ud_protocol::MULTICAST_ADDR),
            };
            let source_addr = match n.source_addr {
                Some(s) => Some(s.parse::<Ipv4Addr>().map_err(|_| {
                    ConfigError::InvalidValue(format!("invalid source_addr: '{s}'"))
                })?),
                None => None,
            };
            NetworkConfig {
                multicast_addr,
                source_addr,
            }
        }
        None => NetworkConfig {
            multicast_addr: SocketAddr::V4(ud_protocol::MULTICAST_ADDR),
            source_addr: None,
        },
    };

    Ok(ControllerConfig {
        schema_version,
        network,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
