//! Common types shared by both sides of the bridge

use serde::{Deserialize, Serialize};

/// Stable identifier of a native port
///
/// Unique per physical port for the lifetime of the host process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub String);

impl PortId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PortId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one access handle inside a content context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessId(pub u64);

impl std::fmt::Display for AccessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "access#{}", self.0)
    }
}

/// Direction of a port, from the script's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Input,
    Output,
}

impl PortType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Whether the device behind a port is present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Connected,
    Disconnected,
}

/// Whether the port is open for traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closed,
    Pending,
}

/// Observable properties of one native port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub id: PortId,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub port_type: PortType,
    pub version: String,
    pub state: PortState,
    pub connection: ConnectionState,
}

impl PortDescriptor {
    /// Descriptor for a port that is present and open, the way the native
    /// side reports every port it can enumerate.
    #[must_use]
    pub fn connected(id: impl Into<PortId>, port_type: PortType) -> Self {
        Self {
            id: id.into(),
            manufacturer: None,
            name: None,
            port_type,
            version: DEFAULT_PORT_VERSION.to_string(),
            state: PortState::Connected,
            connection: ConnectionState::Open,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// True when `state` or `connection` differ.
    ///
    /// Name, manufacturer and version changes are property updates, not
    /// observable state changes.
    #[must_use]
    pub fn state_differs(&self, other: &Self) -> bool {
        self.state != other.state || self.connection != other.connection
    }

    /// Copy of this descriptor as reported after the device went away
    #[must_use]
    pub fn disconnected(&self) -> Self {
        Self {
            state: PortState::Disconnected,
            connection: ConnectionState::Closed,
            ..self.clone()
        }
    }
}

/// Version string reported for every native port
pub const DEFAULT_PORT_VERSION: &str = "1";

/// Reason for policy denial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDenialReason {
    pub code: String,
    pub message: String,
    /// Actionable suggestion for the script author
    pub suggestion: Option<String>,
}

impl std::fmt::Display for PolicyDenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
