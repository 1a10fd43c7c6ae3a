//! Session registry - the set of known peers.
//!
//! The registry is owned by the poller task and only mutated there, so it
//! needs no locking. Sessions are keyed by their callback path and kept in
//! insertion order.
//!
//! ```text
//! SocketLocator ──discover()──▶ reconcile() ──▶ Vec<Session>
//!                                                   │
//!                                terminate(key) ◀───┤ (peer failure)
//!                                shutdown()     ◀───┘ (process exit)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Lookups return `Option`

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use dpx_core::PeerAddress;

use crate::session::{Session, SessionConfig, TeardownReport};

/// All sessions known to the agent.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
    session_config: SessionConfig,
}

impl SessionRegistry {
    /// Creates an empty registry; new sessions get `session_config`.
    pub fn new(session_config: SessionConfig) -> Self {
        Self {
            sessions: Vec::new(),
            session_config,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns true if a session exists for this callback path.
    pub fn contains(&self, callback: &Path) -> bool {
        self.position(callback).is_some()
    }

    pub fn get(&self, callback: &Path) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.address().callback_path() == callback)
    }

    pub fn get_mut(&mut self, callback: &Path) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.address().callback_path() == callback)
    }

    /// Callback paths of all sessions, in insertion order.
    ///
    /// Returned owned so callers can mutate the registry while iterating.
    pub fn keys(&self) -> Vec<PathBuf> {
        self.sessions
            .iter()
            .map(|s| s.address().callback_path().to_path_buf())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    /// Adds an Unbound session for every address not already tracked.
    ///
    /// Never removes sessions. Returns how many were created.
    pub fn reconcile<I>(&mut self, discovered: I) -> usize
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let mut created = 0;
        for address in discovered {
            if self.contains(address.callback_path()) {
                continue;
            }
            debug!(peer = %address, "Tracking new peer");
            self.sessions
                .push(Session::new(address, self.session_config));
            created += 1;
        }

        if created > 0 {
            info!(created, total = self.sessions.len(), "Registry reconciled");
        }
        created
    }

    /// Inserts a prepared session. Returns false if the key is taken.
    pub fn insert(&mut self, session: Session) -> bool {
        if self.contains(session.address().callback_path()) {
            return false;
        }
        self.sessions.push(session);
        true
    }

    /// Tears a session down and removes it.
    ///
    /// The session stays tracked until teardown finishes, so a caller that
    /// drops this future midway leaves it for [`shutdown`](Self::shutdown).
    /// Returns `None` if no session has this key.
    pub async fn terminate(&mut self, callback: &Path) -> Option<TeardownReport> {
        let index = self.position(callback)?;
        let report = self.sessions.get_mut(index)?.unregister().await;
        let session = self.sessions.remove(index);
        info!(peer = %session.address(), "Session removed from registry");
        Some(report)
    }

    /// Tears down every session. Returns how many were removed.
    pub async fn shutdown(&mut self) -> usize {
        let sessions = std::mem::take(&mut self.sessions);
        let count = sessions.len();
        for mut session in sessions {
            session.unregister().await;
        }
        if count > 0 {
            info!(count, "All sessions unregistered");
        }
        count
    }

    fn position(&self, callback: &Path) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.address().callback_path() == callback)
    }
}
