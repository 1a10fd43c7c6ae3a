//! One peer relationship and its registration handshake.
//!
//! A runtime instance cannot be dialed for callbacks, so the agent binds a
//! listener next to the instance's advertiser socket, tells the instance
//! where it is, and waits for the instance to connect back:
//!
//! ```text
//!  agent                                   runtime instance
//!    │ bind <dir>/.client                         │
//!    │ connect <dir>/telemetry ─────────────────▶ │
//!    │ {"action":1,"command":"clients",...} ────▶ │
//!    │ ◀──────────────── connect <dir>/.client    │
//!    │ accept → duplex channel                    │
//!    │ {"action":0,...} ────────────────────────▶ │
//!    │ ◀────────────────────────── {"data":[...]} │
//! ```
//!
//! All traffic uses SOCK_SEQPACKET, so one send is one receive and no
//! framing is needed.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every blocking wait except the bind retry is bounded by `peer_timeout`
//! - Teardown never fails; problems are collected in a `TeardownReport`

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tokio_seqpacket::{UnixSeqpacket, UnixSeqpacketListener};
use tracing::{debug, info, warn};

use dpx_core::{PeerAddress, SessionState};
use dpx_protocol::{decode_snapshot, ControlMessage, DecodeError, DecodedSnapshot};

use crate::config::AgentConfig;
use crate::retry::RetryPolicy;

/// Default bound on waiting for the peer (connect-back and each response).
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while driving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The callback path could not be bound (retry policy exhausted)
    #[error("failed to bind callback socket {path}: {source}")]
    BindContention { path: PathBuf, source: io::Error },

    /// The peer did not connect back in time
    #[error("peer did not connect back to {path} within {timeout:?}")]
    PeerConnectTimeout { path: PathBuf, timeout: Duration },

    /// The advertiser socket refused the connection or the Register message
    #[error("failed to reach peer at {path}: {source}")]
    PeerConnect { path: PathBuf, source: io::Error },

    /// Send or receive failed on the duplex channel
    #[error("peer at {path} unavailable: {reason}")]
    PeerUnavailable { path: PathBuf, reason: String },

    /// The response could not be decoded
    #[error("bad response from {path}: {source}")]
    Decode { path: PathBuf, source: DecodeError },

    /// A request message could not be serialized
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The operation is not valid in the current state
    #[error("session {path} is {state}")]
    InvalidState { path: PathBuf, state: SessionState },
}

impl SessionError {
    /// Returns true if the session must be torn down and rediscovered.
    pub fn is_peer_unavailable(&self) -> bool {
        matches!(self, Self::PeerUnavailable { .. })
    }

    /// Returns true for response decoding problems.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Timing and sizing parameters for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on accept, connect and each response
    pub peer_timeout: Duration,
    /// Largest accepted response
    pub max_message_size: usize,
    /// Policy for binding the callback socket
    pub bind_retry: RetryPolicy,
}

impl SessionConfig {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            peer_timeout: config.peer_timeout(),
            max_message_size: config.max_message_size,
            bind_retry: RetryPolicy::unbounded(config.bind_backoff()),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            max_message_size: dpx_protocol::DEFAULT_MAX_MESSAGE_SIZE,
            bind_retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Teardown Report
// ============================================================================

/// What happened while tearing a session down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Unregister message was delivered
    pub notified: bool,
    /// Callback socket file was removed by this teardown
    pub callback_removed: bool,
    /// Cleanup steps that failed (logged, never fatal)
    pub failures: Vec<String>,
}

// ============================================================================
// Session
// ============================================================================

/// A relationship with one runtime instance.
///
/// The session exclusively owns its sockets and its callback file. Teardown
/// is explicit through [`Session::unregister`].
pub struct Session {
    address: PeerAddress,
    state: SessionState,
    config: SessionConfig,

    /// Callback listener, bound at `address.callback_path()`
    listener: Option<UnixSeqpacketListener>,

    /// Control connection to the advertiser; only carries Register
    outbound: Option<UnixSeqpacket>,

    /// Accepted connection from the peer; present only while Active
    duplex: Option<UnixSeqpacket>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("listening", &self.listener.is_some())
            .field("connected", &self.duplex.is_some())
            .finish()
    }
}

impl Session {
    /// Creates an unbound session.
    pub fn new(address: PeerAddress, config: SessionConfig) -> Self {
        Self {
            address,
            state: SessionState::Unbound,
            config,
            listener: None,
            outbound: None,
            duplex: None,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True iff the callback path currently exists on the filesystem.
    pub fn is_bound(&self) -> bool {
        self.address.callback_path().symlink_metadata().is_ok()
    }

    /// True if the session can serve snapshot requests right now.
    pub fn is_ready(&self) -> bool {
        self.state.is_active() && self.duplex.is_some() && self.is_bound()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Runs the registration handshake until the session is Active.
    ///
    /// Binding the callback socket is retried according to the bind retry
    /// policy (forever by default) while the instance directory exists. A peer that refuses the Register message
    /// or never connects back fails the attempt; the session is then reset
    /// to Unbound with its callback file removed.
    pub async fn register(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Terminated {
            return Err(self.invalid_state());
        }

        // Start from a clean slate: a previous attempt or a dead duplex
        // channel must not survive into the new registration.
        self.release_channels();
        self.state = SessionState::Unbound;

        let listener = self.bind_callback().await?;
        self.listener = Some(listener);
        self.state = SessionState::AwaitingPeerConnect;
        debug!(peer = %self.address, "Callback bound, registering with peer");

        match self.handshake().await {
            Ok(duplex) => {
                self.duplex = Some(duplex);
                self.state = SessionState::Active;
                info!(
                    peer = %self.address,
                    callback = %self.address.callback_path().display(),
                    "Session active"
                );
                Ok(())
            }
            Err(e) => {
                self.abort_registration();
                Err(e)
            }
        }
    }

    /// Binds the callback listener, removing stale files and retrying.
    ///
    /// Only failures that can clear are retried: an address in use, or any
    /// error while the instance directory still exists. Once the directory
    /// is gone the error is returned at once.
    async fn bind_callback(&self) -> Result<UnixSeqpacketListener, SessionError> {
        let path = self.address.callback_path().to_path_buf();
        let instance_dir = self.address.instance_dir().map(Path::to_path_buf);
        let retryable = |e: &SessionError| match e {
            SessionError::BindContention { source, .. } => {
                source.kind() == io::ErrorKind::AddrInUse
                    || instance_dir.as_deref().is_some_and(Path::is_dir)
            }
            _ => false,
        };

        self.config
            .bind_retry
            .run_while(
                |attempt| {
                    remove_stale_socket(&path);
                    UnixSeqpacketListener::bind(&path).map_err(|source| {
                        warn!(
                            path = %path.display(),
                            attempt,
                            error = %source,
                            "Callback socket bind failed"
                        );
                        SessionError::BindContention {
                            path: path.clone(),
                            source,
                        }
                    })
                },
                retryable,
            )
            .await
    }

    /// Sends Register over a fresh outbound connection and accepts the
    /// peer's connect-back.
    async fn handshake(&mut self) -> Result<UnixSeqpacket, SessionError> {
        let peer_timeout = self.config.peer_timeout;
        let advertiser = self.address.advertiser_path().to_path_buf();

        let outbound = match timeout(peer_timeout, UnixSeqpacket::connect(&advertiser)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(source)) => {
                return Err(SessionError::PeerConnect {
                    path: advertiser,
                    source,
                })
            }
            Err(_) => {
                return Err(SessionError::PeerConnect {
                    path: advertiser,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        let register = ControlMessage::register(self.address.callback_path())
            .to_bytes()
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        match timeout(peer_timeout, outbound.send(&register)).await {
            Ok(Ok(_)) => {}
            Ok(Err(source)) => {
                return Err(SessionError::PeerConnect {
                    path: advertiser,
                    source,
                })
            }
            Err(_) => {
                return Err(SessionError::PeerConnect {
                    path: advertiser,
                    source: io::Error::new(io::ErrorKind::TimedOut, "register send timed out"),
                })
            }
        }
        self.outbound = Some(outbound);

        let callback = self.address.callback_path().to_path_buf();
        let Some(listener) = self.listener.as_mut() else {
            return Err(SessionError::InvalidState {
                path: callback,
                state: self.state,
            });
        };

        match timeout(peer_timeout, listener.accept()).await {
            Ok(Ok(duplex)) => Ok(duplex),
            Ok(Err(source)) => Err(SessionError::PeerConnect {
                path: callback,
                source,
            }),
            Err(_) => Err(SessionError::PeerConnectTimeout {
                path: callback,
                timeout: peer_timeout,
            }),
        }
    }

    /// Undoes a partial registration so the next attempt starts fresh.
    fn abort_registration(&mut self) {
        self.release_channels();
        if let Err(e) = remove_socket_file(self.address.callback_path()) {
            debug!(
                path = %self.address.callback_path().display(),
                error = %e,
                "Failed to remove callback after aborted registration"
            );
        }
        self.state = SessionState::Unbound;
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Requests one snapshot and returns the raw response message.
    ///
    /// Send/receive failures, timeouts and a closed channel are
    /// `PeerUnavailable`; the caller is expected to tear the session down.
    /// A response larger than `max_message_size` is a decode failure and
    /// leaves the session Active.
    pub async fn request_snapshot(&mut self) -> Result<Vec<u8>, SessionError> {
        if !self.state.is_active() {
            return Err(self.invalid_state());
        }

        let peer_timeout = self.config.peer_timeout;
        let max = self.config.max_message_size;
        let path = self.address.callback_path().to_path_buf();

        let request = ControlMessage::snapshot_request()
            .to_bytes()
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        let Some(duplex) = self.duplex.as_mut() else {
            return Err(SessionError::InvalidState {
                path,
                state: self.state,
            });
        };

        match timeout(peer_timeout, duplex.send(&request)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(SessionError::PeerUnavailable {
                    path,
                    reason: format!("send failed: {e}"),
                })
            }
            Err(_) => {
                return Err(SessionError::PeerUnavailable {
                    path,
                    reason: "send timed out".to_string(),
                })
            }
        }

        // One extra byte detects messages the transport would truncate.
        let mut buf = vec![0u8; max.saturating_add(1)];
        let received = match timeout(peer_timeout, duplex.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return Err(SessionError::PeerUnavailable {
                    path,
                    reason: format!("receive failed: {e}"),
                })
            }
            Err(_) => {
                return Err(SessionError::PeerUnavailable {
                    path,
                    reason: format!("no response within {peer_timeout:?}"),
                })
            }
        };

        if received == 0 {
            return Err(SessionError::PeerUnavailable {
                path,
                reason: "peer closed the connection".to_string(),
            });
        }

        if received > max {
            return Err(SessionError::Decode {
                path,
                source: DecodeError::Oversized {
                    size: received,
                    max,
                },
            });
        }

        buf.truncate(received);
        Ok(buf)
    }

    /// Requests a snapshot and decodes it.
    pub async fn fetch_snapshot(&mut self) -> Result<DecodedSnapshot, SessionError> {
        let payload = self.request_snapshot().await?;
        decode_snapshot(&payload, self.config.max_message_size).map_err(|source| {
            SessionError::Decode {
                path: self.address.callback_path().to_path_buf(),
                source,
            }
        })
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Notifies the peer (best effort) and releases every resource.
    ///
    /// Always completes: channels are closed and the callback file is
    /// removed whether or not the Unregister message got through. Only
    /// artifacts this session created are deleted; the peer's advertiser
    /// socket is left alone.
    pub async fn unregister(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(duplex) = self.duplex.as_mut() {
            match ControlMessage::unregister(self.address.callback_path()).to_bytes() {
                Ok(msg) => match timeout(self.config.peer_timeout, duplex.send(&msg)).await {
                    Ok(Ok(_)) => report.notified = true,
                    Ok(Err(e)) => report.failures.push(format!("unregister send failed: {e}")),
                    Err(_) => report.failures.push("unregister send timed out".to_string()),
                },
                Err(e) => report.failures.push(format!("unregister encode failed: {e}")),
            }
        }

        self.release_channels();

        match remove_socket_file(self.address.callback_path()) {
            Ok(removed) => report.callback_removed = removed,
            Err(e) => report.failures.push(format!(
                "failed to remove {}: {e}",
                self.address.callback_path().display()
            )),
        }

        for failure in &report.failures {
            warn!(peer = %self.address, failure = %failure, "Cleanup step failed");
        }

        self.state = SessionState::Terminated;
        debug!(
            peer = %self.address,
            notified = report.notified,
            callback_removed = report.callback_removed,
            "Session terminated"
        );

        report
    }

    /// Drops all sockets held by the session.
    fn release_channels(&mut self) {
        self.duplex = None;
        self.outbound = None;
        self.listener = None;
    }

    fn invalid_state(&self) -> SessionError {
        SessionError::InvalidState {
            path: self.address.callback_path().to_path_buf(),
            state: self.state,
        }
    }
}

// ============================================================================
// Filesystem Helpers
// ============================================================================

/// Removes a leftover callback file from a crashed prior run, if any.
fn remove_stale_socket(path: &Path) {
    match remove_socket_file(path) {
        Ok(true) => debug!(path = %path.display(), "Removed stale callback socket"),
        Ok(false) => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Could not remove stale callback socket"),
    }
}

/// Removes `path`. Returns `Ok(false)` if it did not exist.
fn remove_socket_file(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn short_config() -> SessionConfig {
        SessionConfig {
            peer_timeout: Duration::from_millis(200),
            max_message_size: 1024,
            bind_retry: RetryPolicy::bounded(Duration::from_millis(10), 2),
        }
    }

    fn session_in(dir: &TempDir) -> Session {
        let address = PeerAddress::new(dir.path().join("telemetry")).unwrap();
        Session::new(address, short_config())
    }

    #[test]
    fn test_new_session_is_unbound() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(!session.is_bound());
        assert!(!session.is_ready());
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.peer_timeout, Duration::from_secs(2));
        assert_eq!(config.max_message_size, 200_000);
        assert_eq!(config.bind_retry.max_attempts(), None);
    }

    #[test]
    fn test_is_bound_follows_filesystem() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        std::fs::write(dir.path().join(".client"), "").unwrap();
        assert!(session.is_bound());
    }

    #[tokio::test]
    async fn test_snapshot_requires_active() {
        let dir = TempDir::new().unwrap();
        let mut session = session_in(&dir);
        let err = session.request_snapshot().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Unbound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_register_without_peer_fails_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut session = session_in(&dir);

        // A stale callback file from a previous run must not block binding.
        std::fs::write(dir.path().join(".client"), "stale").unwrap();

        let err = session.register().await.unwrap_err();
        assert!(matches!(err, SessionError::PeerConnect { .. }));
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(!session.is_bound());
    }

    #[tokio::test]
    async fn test_register_times_out_when_peer_never_connects_back() {
        let dir = TempDir::new().unwrap();
        let advertiser = dir.path().join("telemetry");
        let mut silent_peer = UnixSeqpacketListener::bind(&advertiser).unwrap();

        // Accept the control connection and read Register, but never dial back.
        let peer = tokio::spawn(async move {
            let conn = silent_peer.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let n = conn.recv(&mut buf).await.unwrap();
            let msg: ControlMessage = serde_json::from_slice(&buf[..n]).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            msg
        });

        let mut session = session_in(&dir);
        let err = session.register().await.unwrap_err();
        assert!(matches!(err, SessionError::PeerConnectTimeout { .. }));
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(!session.is_bound());

        let msg = peer.await.unwrap();
        assert_eq!(msg, ControlMessage::register(&dir.path().join(".client")));
    }

    #[tokio::test]
    async fn test_bind_contention_exhausts_bounded_policy() {
        let dir = TempDir::new().unwrap();
        let mut session = session_in(&dir);
        // A directory squatting on the callback path cannot be cleared away.
        std::fs::create_dir(dir.path().join(".client")).unwrap();
        std::fs::write(dir.path().join(".client").join("keep"), "").unwrap();

        let start = std::time::Instant::now();
        let err = session.register().await.unwrap_err();
        assert!(matches!(err, SessionError::BindContention { .. }));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(session.state(), SessionState::Unbound);
    }

    #[tokio::test]
    async fn test_bind_in_missing_directory_is_not_retried() {
        let address = PeerAddress::new("/nonexistent-dpx-dir/rte/telemetry").unwrap();
        let config = SessionConfig {
            bind_retry: RetryPolicy::unbounded(Duration::from_millis(50)),
            ..short_config()
        };
        let mut session = Session::new(address, config);

        let err = tokio::time::timeout(Duration::from_secs(2), session.register())
            .await
            .expect("bind in a missing directory must fail without retrying")
            .unwrap_err();
        assert!(matches!(err, SessionError::BindContention { .. }));
        assert_eq!(session.state(), SessionState::Unbound);
    }

    #[tokio::test]
    async fn test_unregister_unbound_removes_stale_file() {
        let dir = TempDir::new().unwrap();
        let mut session = session_in(&dir);
        std::fs::write(dir.path().join(".client"), "stale").unwrap();

        let report = session.unregister().await;
        assert!(!report.notified);
        assert!(report.callback_removed);
        assert!(report.failures.is_empty());
        assert!(!session.is_bound());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_unregister_never_touches_advertiser() {
        let dir = TempDir::new().unwrap();
        let advertiser = dir.path().join("telemetry");
        std::fs::write(&advertiser, "").unwrap();

        let mut session = session_in(&dir);
        session.unregister().await;
        assert!(advertiser.exists());
    }

    #[tokio::test]
    async fn test_terminated_session_cannot_register() {
        let dir = TempDir::new().unwrap();
        let mut session = session_in(&dir);
        session.unregister().await;

        let err = session.register().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Terminated,
                ..
            }
        ));
    }

    #[test]
    fn test_error_classification() {
        let unavailable = SessionError::PeerUnavailable {
            path: PathBuf::from("/run/x/.client"),
            reason: "closed".to_string(),
        };
        assert!(unavailable.is_peer_unavailable());
        assert!(!unavailable.is_decode_failure());

        let decode = SessionError::Decode {
            path: PathBuf::from("/run/x/.client"),
            source: DecodeError::EmptyData,
        };
        assert!(decode.is_decode_failure());
        assert!(decode.to_string().contains("no port data"));
    }
}
