use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a DGI instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Physical device categories attached to a grid node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Distributed renewable energy resource.
    Drer,
    /// Distributed energy storage device.
    Desd,
    Load,
    /// Grid tie point.
    Grid,
    /// Solid state transformer, the setpoint actuator.
    Sst,
    /// Diesel generator.
    Dg,
    /// Photovoltaic panel.
    Pv,
    /// Wind turbine.
    Wt,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            DeviceKind::Drer => "DRER",
            DeviceKind::Desd => "DESD",
            DeviceKind::Load => "LOAD",
            DeviceKind::Grid => "GRID",
            DeviceKind::Sst => "SST",
            DeviceKind::Dg => "DG",
            DeviceKind::Pv => "PV",
            DeviceKind::Wt => "WT",
        };
        write!(f, "{}", tag)
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drer" => Ok(DeviceKind::Drer),
            "desd" => Ok(DeviceKind::Desd),
            "load" => Ok(DeviceKind::Load),
            "grid" => Ok(DeviceKind::Grid),
            "sst" => Ok(DeviceKind::Sst),
            "dg" => Ok(DeviceKind::Dg),
            "pv" | "pvpanel" => Ok(DeviceKind::Pv),
            "wt" | "wturbine" => Ok(DeviceKind::Wt),
            other => Err(Error::Config(format!("unknown device kind: {}", other))),
        }
    }
}

/// Identifies one physical device: a type tag plus an instance name.
///
/// Devices owned by a plug-and-play session carry scoped names of the form
/// `identifier:name`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub name: String,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }

    /// The portion of the name after the last `:`, used on the adapter wire.
    pub fn local_name(&self) -> &str {
        match self.name.rfind(':') {
            Some(idx) => &self.name[idx + 1..],
            None => &self.name,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer unreachable: {0}")]
    PeerSend(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
