//! Daemon configuration file.
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//! endpoint = "ws://127.0.0.1:8080/ocpp"
//! identity = "ID002"
//! heartbeat_interval_s = 300
//!
//! [rpc]
//! strict = true
//! ping_interval_ms = 30000
//! ```

use ocpp_rpc::RpcConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings shared by `ocpp-central` and `ocpp-station`. Each binary reads
/// the fields it needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Where the central system listens.
    pub listen: SocketAddr,
    /// Base URL the station dials; its identity is appended.
    pub endpoint: String,
    pub identity: String,
    pub password: Option<String>,
    /// Heartbeat interval handed out on boot, in seconds.
    pub heartbeat_interval_s: u64,
    pub rpc: RpcConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            endpoint: "ws://127.0.0.1:8080/ocpp".to_string(),
            identity: "ID002".to_string(),
            password: None,
            heartbeat_interval_s: 300,
            rpc: RpcConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }
}
