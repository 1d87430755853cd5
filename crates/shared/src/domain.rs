use serde::{Deserialize, Serialize};

/// Host reported as `connectedTo` for a terminal on the same machine.
pub const LOCAL_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "address", rename_all = "snake_case")]
pub enum ConnectionMode {
    Local,
    Remote(String),
}

impl ConnectionMode {
    /// Remote mode needs an address; a blank one falls back to local.
    pub fn from_settings(remote: bool, remote_address: &str) -> Self {
        let address = remote_address.trim();
        if remote && !address.is_empty() {
            Self::Remote(address.to_string())
        } else {
            Self::Local
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn remote_address(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Remote(address) => Some(address),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Local => LOCAL_HOST,
            Self::Remote(address) => address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub enabled: bool,
    pub registered: bool,
    pub mode: ConnectionMode,
}

impl ConnectionState {
    pub fn new(enabled: bool, mode: ConnectionMode) -> Self {
        Self {
            enabled,
            registered: false,
            mode,
        }
    }

    pub fn connected_to(&self) -> Option<String> {
        self.registered.then(|| self.mode.host().to_string())
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            enabled: self.enabled,
            registered: self.registered,
            connected_to: self.connected_to(),
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(true, ConnectionMode::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub enabled: bool,
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worksheet {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub securities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMatch {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}
