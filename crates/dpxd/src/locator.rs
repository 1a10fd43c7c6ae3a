//! Socket discovery - finds runtime instances advertising telemetry.
//!
//! Scans `<root>/*/<advertiser>` (by default `/var/run/dpdk/*/telemetry`)
//! for socket files and pairs each with its callback path.
//!
//! # Async Safety
//!
//! All filesystem operations are run via `spawn_blocking` to avoid
//! blocking the async runtime.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Entries that cannot be inspected are skipped and logged
//! - Only an unreadable root directory is reported as an error

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace, warn};

use dpx_core::PeerAddress;

use crate::config::AgentConfig;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// The root exists but cannot be listed
    #[error("failed to read socket root {path}: {source}")]
    RootUnreadable { path: PathBuf, source: io::Error },

    /// The blocking scan task did not complete
    #[error("discovery task failed: {0}")]
    TaskFailed(String),
}

// ============================================================================
// Socket Locator
// ============================================================================

/// Where advertiser sockets come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorSource {
    /// One subdirectory per instance under `root`, each holding `advertiser_file_name`
    Scan {
        root: PathBuf,
        advertiser_file_name: String,
    },
    /// A fixed list of advertiser sockets
    Explicit(Vec<PathBuf>),
}

/// Finds advertiser sockets and derives their peer addresses.
#[derive(Debug, Clone)]
pub struct SocketLocator {
    source: LocatorSource,
    callback_file_name: String,
}

impl SocketLocator {
    /// Creates a locator scanning `root`.
    #[must_use]
    pub fn scan(
        root: impl Into<PathBuf>,
        advertiser_file_name: impl Into<String>,
        callback_file_name: impl Into<String>,
    ) -> Self {
        Self {
            source: LocatorSource::Scan {
                root: root.into(),
                advertiser_file_name: advertiser_file_name.into(),
            },
            callback_file_name: callback_file_name.into(),
        }
    }

    /// Creates a locator reporting a fixed set of advertiser sockets.
    #[must_use]
    pub fn explicit(paths: Vec<PathBuf>, callback_file_name: impl Into<String>) -> Self {
        Self {
            source: LocatorSource::Explicit(paths),
            callback_file_name: callback_file_name.into(),
        }
    }

    /// Creates a locator from configuration. Explicit sockets win over the scan.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        if config.sockets.is_empty() {
            Self::scan(
                config.socket_root.clone(),
                config.advertiser_file_name.clone(),
                config.callback_file_name.clone(),
            )
        } else {
            Self::explicit(config.sockets.clone(), config.callback_file_name.clone())
        }
    }

    pub fn source(&self) -> &LocatorSource {
        &self.source
    }

    /// Discovers peers without blocking the runtime.
    ///
    /// Returns addresses sorted and deduplicated. An empty result is not
    /// an error.
    pub async fn discover(&self) -> Result<Vec<PeerAddress>, LocatorError> {
        let locator = self.clone();
        tokio::task::spawn_blocking(move || locator.discover_blocking())
            .await
            .map_err(|e| LocatorError::TaskFailed(e.to_string()))?
    }

    /// Discovers peers on the calling thread.
    ///
    /// This function performs blocking I/O and should be called via `spawn_blocking`.
    pub fn discover_blocking(&self) -> Result<Vec<PeerAddress>, LocatorError> {
        let advertisers = match &self.source {
            LocatorSource::Scan {
                root,
                advertiser_file_name,
            } => scan_root(root, advertiser_file_name)?,
            LocatorSource::Explicit(paths) => paths
                .iter()
                .filter(|p| is_socket(p))
                .cloned()
                .collect(),
        };

        let mut peers: Vec<PeerAddress> = advertisers
            .into_iter()
            .filter_map(|path| {
                match PeerAddress::with_callback_name(&path, &self.callback_file_name) {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping advertiser socket");
                        None
                    }
                }
            })
            .collect();

        peers.sort();
        peers.dedup_by(|a, b| a.callback_path() == b.callback_path());

        trace!(count = peers.len(), "Discovery pass complete");
        Ok(peers)
    }
}

// ============================================================================
// Blocking Filesystem Operations
// ============================================================================

/// Lists `<root>/*/<advertiser_file_name>` entries that are sockets.
fn scan_root(root: &Path, advertiser_file_name: &str) -> Result<Vec<PathBuf>, LocatorError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "Socket root does not exist yet");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(LocatorError::RootUnreadable {
                path: root.to_path_buf(),
                source,
            });
        }
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let instance_dir = entry.path();
        if !instance_dir.is_dir() {
            continue;
        }

        let candidate = instance_dir.join(advertiser_file_name);
        if is_socket(&candidate) {
            found.push(candidate);
        } else {
            trace!(dir = %instance_dir.display(), "No advertiser socket in directory");
        }
    }

    Ok(found)
}

/// Returns true if `path` exists and is a UNIX socket.
fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
