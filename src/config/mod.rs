//! Node Configuration
//!
//! Defines the structure of the node configuration file on disk (TOML).

use crate::types::{DeviceKind, Error, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for one DGI node (gridnode.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Identity of this node. Generated when absent.
    #[serde(default = "default_uuid")]
    pub uuid: String,

    /// Path to the physical topology file. Empty disables the dispatch solver.
    #[serde(default)]
    pub topology: Option<PathBuf>,

    #[serde(default)]
    pub timing: TimingConfig,

    /// Plug-and-play adapter sessions hosted by this node.
    #[serde(default, rename = "adapter")]
    pub adapters: Vec<AdapterConfig>,
}

fn default_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Timing constants for the coordination modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Seconds between clock synchronizer exchange rounds.
    #[serde(default = "default_query_interval")]
    pub query_interval_secs: u64,

    /// Seconds between load balancer ticks.
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,

    /// Seconds between leader state collection requests.
    #[serde(default = "default_state_timeout")]
    pub state_timeout_secs: u64,

    /// Half-width of the NORMAL band in the load classification.
    #[serde(default = "default_normal_tolerance")]
    pub normal_tolerance: f64,
}

fn default_query_interval() -> u64 {
    10
}

fn default_load_timeout() -> u64 {
    10
}

fn default_state_timeout() -> u64 {
    15
}

fn default_normal_tolerance() -> f64 {
    0.5
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            query_interval_secs: default_query_interval(),
            load_timeout_secs: default_load_timeout(),
            state_timeout_secs: default_state_timeout(),
            normal_tolerance: default_normal_tolerance(),
        }
    }
}

/// One plug-and-play adapter session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Session identifier; scopes every device name as `identifier:name`.
    pub identifier: String,

    /// TCP port the remote board connects to. Port 0 binds an ephemeral port.
    pub state_port: u16,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_command")]
    pub command_secs: u64,

    #[serde(default, rename = "device")]
    pub devices: Vec<AdapterDeviceConfig>,
}

fn default_heartbeat() -> u64 {
    5
}

fn default_command() -> u64 {
    2
}

/// A physical device exposed by a remote board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDeviceConfig {
    pub name: String,
    pub kind: DeviceKind,

    /// Signals reported by the board in DeviceStates packets.
    #[serde(default)]
    pub state: Vec<String>,

    /// Signals commanded by the DGI in egress packets.
    #[serde(default)]
    pub command: Vec<String>,
}

impl GridConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: GridConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for adapter in &self.adapters {
            if adapter.identifier.is_empty() {
                return Err(Error::Config("adapter identifier must not be empty".into()));
            }
            if adapter.identifier.contains(char::is_whitespace) {
                return Err(Error::Config(format!(
                    "adapter identifier '{}' must not contain whitespace",
                    adapter.identifier
                )));
            }
        }
        Ok(())
    }

    pub fn local_id(&self) -> PeerId {
        PeerId::new(self.uuid.clone())
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            uuid: default_uuid(),
            topology: None,
            timing: TimingConfig::default(),
            adapters: Vec::new(),
        }
    }
}
