//! Peer identity: advertiser socket plus the derived callback socket.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

// ============================================================================
// Filesystem Conventions
// ============================================================================

/// Root directory scanned for runtime instances (one subdirectory each).
pub const DEFAULT_SOCKET_ROOT: &str = "/var/run/dpdk";

/// File name of the socket a runtime instance listens on for registrations.
pub const DEFAULT_ADVERTISER_FILE_NAME: &str = "telemetry";

/// File name of the socket this agent binds next to the advertiser.
pub const DEFAULT_CALLBACK_FILE_NAME: &str = ".client";

// ============================================================================
// Peer Address
// ============================================================================

/// Identity of one runtime instance as seen by the agent.
///
/// The callback path is always a sibling of the advertiser path, so running
/// discovery again for the same peer yields an equal `PeerAddress`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    advertiser: PathBuf,
    callback: PathBuf,
}

impl PeerAddress {
    /// Builds an address using the default callback file name (`.client`).
    pub fn new(advertiser: impl Into<PathBuf>) -> DomainResult<Self> {
        Self::with_callback_name(advertiser, DEFAULT_CALLBACK_FILE_NAME)
    }

    /// Builds an address with a custom callback file name.
    pub fn with_callback_name(
        advertiser: impl Into<PathBuf>,
        callback_file_name: &str,
    ) -> DomainResult<Self> {
        let advertiser = advertiser.into();
        let callback = callback_path_for(&advertiser, callback_file_name)?;
        Ok(Self {
            advertiser,
            callback,
        })
    }

    /// Path of the peer-owned socket dialed to register.
    pub fn advertiser_path(&self) -> &Path {
        &self.advertiser
    }

    /// Path of the agent-owned socket the peer connects back to.
    pub fn callback_path(&self) -> &Path {
        &self.callback
    }

    /// Directory holding both sockets.
    pub fn instance_dir(&self) -> Option<&Path> {
        self.advertiser.parent()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.advertiser.display())
    }
}

/// Derives the callback socket path for an advertiser socket.
///
/// Pure: replaces the file name component, keeping the directory. Fails for
/// paths without a parent or file name, and when the callback name would
/// collide with the advertiser's own file name.
pub fn callback_path_for(advertiser: &Path, callback_file_name: &str) -> DomainResult<PathBuf> {
    validate_file_name(callback_file_name)?;

    let file_name = advertiser
        .file_name()
        .ok_or_else(|| DomainError::InvalidAdvertiserPath {
            path: advertiser.to_path_buf(),
            reason: "missing file name".to_string(),
        })?;

    if file_name == callback_file_name {
        return Err(DomainError::InvalidAdvertiserPath {
            path: advertiser.to_path_buf(),
            reason: format!("file name collides with callback name '{callback_file_name}'"),
        });
    }

    let parent = advertiser
        .parent()
        .ok_or_else(|| DomainError::InvalidAdvertiserPath {
            path: advertiser.to_path_buf(),
            reason: "missing parent directory".to_string(),
        })?;

    Ok(parent.join(callback_file_name))
}

/// Checks that a name is a single, non-empty path component.
pub fn validate_file_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::InvalidFileName {
            name: name.to_string(),
            reason: "empty".to_string(),
        });
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(DomainError::InvalidFileName {
            name: name.to_string(),
            reason: "must be a single path component".to_string(),
        });
    }
    Ok(())
}
