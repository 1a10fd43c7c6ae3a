//! Decoding of snapshot responses.
//!
//! Response shape consumed:
//!
//! ```text
//! {"status_code": "Status OK: 200",            (optional)
//!  "data": [{"podName": "...", "pci_address": "...", "namespace": "...",
//!            "stats": [{"name": "...", "value": <number>}, ...]}]}
//! ```
//!
//! Only `data[0]` is turned into a record. Additional entries are counted
//! in [`DecodedSnapshot::ignored_entries`] so the caller can report them.

use dpx_core::{MetricRecord, PortIdentity, Stat};
use serde::Deserialize;
use thiserror::Error;

/// Largest response accepted from a peer, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 200_000;

/// Prefix of a successful `status_code`.
const STATUS_OK_PREFIX: &str = "Status OK";

/// Errors that can occur while decoding a snapshot response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Response too large: at least {size} bytes (max: {max})")]
    Oversized { size: usize, max: usize },

    #[error("Response is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Response contains no port data")]
    EmptyData,

    #[error("Peer reported failure: {0}")]
    PeerStatus(String),
}

/// Raw response document.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<PortSnapshot>>,
}

/// One element of the response `data` array.
#[derive(Debug, Clone, Deserialize)]
pub struct PortSnapshot {
    #[serde(rename = "podName")]
    pub pod_name: String,
    pub pci_address: String,
    pub namespace: String,
    pub stats: Vec<RawStat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStat {
    pub name: String,
    pub value: f64,
}

/// Result of a successful decode.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSnapshot {
    pub record: MetricRecord,
    /// Entries after `data[0]` that were not decoded
    pub ignored_entries: usize,
}

impl SnapshotResponse {
    /// Converts the first port entry into a record.
    pub fn into_record(self) -> Result<DecodedSnapshot, DecodeError> {
        if let Some(status) = self.status_code.as_deref() {
            if !status.starts_with(STATUS_OK_PREFIX) {
                return Err(DecodeError::PeerStatus(status.to_string()));
            }
        }

        let entries = self.data.unwrap_or_default();
        let ignored_entries = entries.len().saturating_sub(1);
        let first = entries.into_iter().next().ok_or(DecodeError::EmptyData)?;

        Ok(DecodedSnapshot {
            record: first.into_record(),
            ignored_entries,
        })
    }
}

impl PortSnapshot {
    fn into_record(self) -> MetricRecord {
        let identity = PortIdentity::new(self.pod_name, self.pci_address, self.namespace);
        let stats = self
            .stats
            .into_iter()
            .map(|s| Stat::new(s.name, s.value))
            .collect();
        MetricRecord::new(identity, stats)
    }
}

/// Decodes one received message.
///
/// `payload` must be exactly the bytes of one transport message. Payloads
/// longer than `max_size` are rejected rather than parsed.
pub fn decode_snapshot(payload: &[u8], max_size: usize) -> Result<DecodedSnapshot, DecodeError> {
    if payload.len() > max_size {
        return Err(DecodeError::Oversized {
            size: payload.len(),
            max: max_size,
        });
    }

    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;

    let response: SnapshotResponse =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    response.into_record()
}
