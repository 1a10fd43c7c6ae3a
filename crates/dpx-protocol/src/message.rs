//! Control and request messages sent by the agent.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Numeric action code carried in every outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    /// Pull request (snapshot)
    Get = 0,
    /// Register a client callback path
    Register = 1,
    /// Unregister a client callback path
    Unregister = 2,
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Get),
            1 => Ok(Self::Register),
            2 => Ok(Self::Unregister),
            other => Err(format!("unknown action code {other}")),
        }
    }
}

/// Command names understood by the runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Client registration management
    #[serde(rename = "clients")]
    Clients,
    /// All statistics for all ports
    #[serde(rename = "ports_all_stat_values")]
    PortsAllStatValues,
}

/// Payload of register/unregister messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    /// Callback socket the runtime instance should connect to
    pub client_path: String,
}

/// A message sent from the agent to a runtime instance.
///
/// Field order is part of the wire shape:
/// `{"action":<n>,"command":"<name>","data":<payload or null>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: Action,
    pub command: Command,
    pub data: Option<ClientData>,
}

impl ControlMessage {
    /// Creates a register message for the given callback path.
    pub fn register(client_path: &Path) -> Self {
        Self {
            action: Action::Register,
            command: Command::Clients,
            data: Some(ClientData {
                client_path: client_path.to_string_lossy().into_owned(),
            }),
        }
    }

    /// Creates an unregister message for the given callback path.
    pub fn unregister(client_path: &Path) -> Self {
        Self {
            action: Action::Unregister,
            command: Command::Clients,
            data: Some(ClientData {
                client_path: client_path.to_string_lossy().into_owned(),
            }),
        }
    }

    /// Creates the snapshot pull request.
    pub fn snapshot_request() -> Self {
        Self {
            action: Action::Get,
            command: Command::PortsAllStatValues,
            data: None,
        }
    }

    /// Serializes to the bytes of one transport message.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
