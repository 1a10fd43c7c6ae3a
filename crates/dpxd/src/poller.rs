//! The polling loop that drives every session.
//!
//! Each cycle:
//! 1. discovers advertiser sockets and reconciles them into the registry
//! 2. registers every session that is not ready
//! 3. requests a snapshot from every ready session and forwards its stats
//!
//! A failing peer only ever affects its own session. Transport failures
//! tear the session down so the next discovery recreates it; decode
//! failures are skipped and the session is kept.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Per-session errors are logged and never leave `run_cycle`

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dpx_core::MetricRecord;

use crate::config::{AgentConfig, DEFAULT_STAT_PREFIX};
use crate::locator::{LocatorError, SocketLocator};
use crate::registry::SessionRegistry;
use crate::session::{SessionConfig, SessionError};
use crate::sink::MetricSink;

/// Default time between cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors that stop the poller.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] LocatorError),
}

impl PollerError {
    /// Returns true if the discovery root itself cannot be read.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Discovery(LocatorError::RootUnreadable { .. }))
    }
}

/// Counters for one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Peers reported by discovery
    pub discovered: usize,
    /// Sessions created by reconcile
    pub created: usize,
    /// Sessions that reached Active this cycle
    pub registered: usize,
    /// Registration attempts that failed
    pub registration_failed: usize,
    /// Sessions that returned a decoded snapshot
    pub polled: usize,
    /// Stats forwarded to the sink
    pub records: usize,
    /// Snapshots skipped because they could not be decoded
    pub decode_failed: usize,
    /// Sessions torn down and removed
    pub terminated: usize,
}

/// Drives discovery, registration and snapshot collection.
pub struct Poller {
    locator: SocketLocator,
    registry: SessionRegistry,
    sink: Arc<dyn MetricSink>,
    poll_interval: Duration,
    stat_prefix: String,
    cancel_token: CancellationToken,
}

impl Poller {
    /// Creates a poller from agent configuration.
    pub fn new(
        config: &AgentConfig,
        sink: Arc<dyn MetricSink>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            locator: SocketLocator::from_config(config),
            registry: SessionRegistry::new(SessionConfig::from_config(config)),
            sink,
            poll_interval: config.poll_interval(),
            stat_prefix: config.stat_prefix.clone(),
            cancel_token,
        }
    }

    /// Creates a poller from explicit parts.
    pub fn with_parts(
        locator: SocketLocator,
        registry: SessionRegistry,
        sink: Arc<dyn MetricSink>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            locator,
            registry,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stat_prefix: DEFAULT_STAT_PREFIX.to_string(),
            cancel_token,
        }
    }

    /// Sets the time between cycles.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the prefix added to stat names.
    #[must_use]
    pub fn stat_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stat_prefix = prefix.into();
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    /// Runs cycles until cancelled, then unregisters every session.
    ///
    /// A fatal discovery error on the first cycle is returned to the caller.
    /// Later discovery errors are logged and the next tick tries again.
    pub async fn run(mut self) -> Result<(), PollerError> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel_token = self.cancel_token.clone();

        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Poller started"
        );

        let mut first_cycle = true;
        let result = loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break Ok(()),

                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break Ok(()),

                outcome = self.run_cycle() => outcome,
            };

            match outcome {
                Ok(report) => debug!(?report, "Cycle complete"),
                Err(e) if first_cycle && e.is_fatal() => break Err(e),
                Err(e) => warn!(error = %e, "Cycle aborted, retrying next tick"),
            }
            first_cycle = false;
        };

        info!(sessions = self.registry.len(), "Poller shutting down");
        self.registry.shutdown().await;
        result
    }

    /// Runs exactly one cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, PollerError> {
        let mut report = CycleReport::default();

        let peers = self.locator.discover().await?;
        report.discovered = peers.len();
        report.created = self.registry.reconcile(peers);

        self.registration_pass(&mut report).await;
        self.snapshot_pass(&mut report).await;

        Ok(report)
    }

    /// Registers every session that cannot serve requests yet.
    async fn registration_pass(&mut self, report: &mut CycleReport) {
        for key in self.registry.keys() {
            let Some(session) = self.registry.get_mut(&key) else {
                continue;
            };
            if session.is_ready() {
                continue;
            }

            match session.register().await {
                Ok(()) => report.registered += 1,
                Err(e) => {
                    report.registration_failed += 1;
                    warn!(callback = %key.display(), error = %e, "Registration failed");

                    // The instance is gone; drop the session so the registry
                    // does not keep retrying a peer that discovery no longer sees.
                    let advertiser_gone = matches!(
                        e,
                        SessionError::PeerConnect { .. } | SessionError::BindContention { .. }
                    ) && !session.address().advertiser_path().exists();
                    if advertiser_gone && self.registry.terminate(&key).await.is_some() {
                        report.terminated += 1;
                    }
                }
            }
        }
    }

    /// Requests a snapshot from every ready session.
    async fn snapshot_pass(&mut self, report: &mut CycleReport) {
        for key in self.registry.keys() {
            let Some(session) = self.registry.get_mut(&key) else {
                continue;
            };
            if !session.is_ready() {
                continue;
            }

            match session.fetch_snapshot().await {
                Ok(decoded) => {
                    if decoded.ignored_entries > 0 {
                        warn!(
                            callback = %key.display(),
                            ignored = decoded.ignored_entries,
                            "Snapshot has more than one port entry; only the first is exported"
                        );
                    }
                    report.polled += 1;
                    report.records += self.forward(&decoded.record);
                }
                Err(e) if e.is_peer_unavailable() => {
                    warn!(callback = %key.display(), error = %e, "Peer unavailable, dropping session");
                    if self.registry.terminate(&key).await.is_some() {
                        report.terminated += 1;
                    }
                }
                Err(e) if e.is_decode_failure() => {
                    report.decode_failed += 1;
                    warn!(callback = %key.display(), error = %e, "Skipping snapshot");
                }
                Err(e) => {
                    warn!(callback = %key.display(), error = %e, "Snapshot request failed");
                }
            }
        }
    }

    /// Pushes every stat of `record` to the sink. Returns how many.
    fn forward(&self, record: &MetricRecord) -> usize {
        let mut count = 0;
        for (name, value) in record.prefixed(&self.stat_prefix) {
            self.sink.record(&record.identity, &name, value);
            count += 1;
        }
        count
    }
}
