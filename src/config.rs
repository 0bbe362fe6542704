//! Network configuration.
//!
//! Loaded from JSON (a string or a file) or assembled through
//! [`NetworkBuilder`](crate::network::NetworkBuilder). Missing fields take
//! their defaults.
//!
//! ```json
//! {
//!   "local_port_start": 0,
//!   "connect_timeout_ms": 5000,
//!   "default_nodelay": false,
//!   "resolver": "system",
//!   "dns_overrides": { "gateway.local": ["192.168.4.1"] }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("connect_timeout_ms must be greater than zero")]
    ZeroTimeout,
}

/// Which resolver a [`Network`](crate::Network) builds when none is given
/// explicitly.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// getaddrinfo on the blocking pool.
    #[default]
    System,
    /// hickory-dns, fully async.
    Hickory,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// First local port assigned to outbound connections. 0 lets the stack
    /// choose ephemeral ports.
    pub local_port_start: u16,
    /// Upper bound on a blocking connect. `None` waits for the stack.
    pub connect_timeout_ms: Option<u64>,
    /// Disable Nagle on every connection as soon as it is established.
    pub default_nodelay: bool,
    pub resolver: ResolverKind,
    /// Hostnames answered without asking the resolver.
    pub dns_overrides: HashMap<String, Vec<IpAddr>>,
}

impl NetworkConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
