//! Session lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a session is in the registration handshake.
///
/// ```text
/// Unbound ──register()──▶ AwaitingPeerConnect ──accept──▶ Active
///    ▲                          │                            │
///    └──── timeout / refused ───┘               unregister() / I/O failure
///                                                            ▼
///                                                       Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No callback listener exists
    #[default]
    Unbound,
    /// Listener bound and Register sent; waiting for the peer to dial back
    AwaitingPeerConnect,
    /// Duplex channel established
    Active,
    /// Channels closed and artifacts removed
    Terminated,
}

impl SessionState {
    /// Returns true if snapshot requests may be sent.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Short lowercase label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::AwaitingPeerConnect => "awaiting_peer_connect",
            Self::Active => "active",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
