//! Destination for decoded statistics.

use std::sync::{Arc, Mutex};

use dpx_core::PortIdentity;

/// Receives one call per stat per successful poll.
///
/// Implementations own retention and exposition; the poller only pushes.
pub trait MetricSink: Send + Sync {
    fn record(&self, identity: &PortIdentity, stat_name: &str, value: f64);
}

impl<T: MetricSink + ?Sized> MetricSink for Arc<T> {
    fn record(&self, identity: &PortIdentity, stat_name: &str, value: f64) {
        (**self).record(identity, stat_name, value);
    }
}

/// One value delivered to a [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SinkEntry {
    pub identity: PortIdentity,
    pub stat_name: String,
    pub value: f64,
}

/// Keeps every recorded value in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<SinkEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    pub fn entries(&self) -> Vec<SinkEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SinkEntry>> {
        // A panic while holding the lock cannot leave a Vec half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetricSink for MemorySink {
    fn record(&self, identity: &PortIdentity, stat_name: &str, value: f64) {
        self.lock().push(SinkEntry {
            identity: identity.clone(),
            stat_name: stat_name.to_string(),
            value,
        });
    }
}
