//! dpx Core - Shared types for DPDK telemetry harvesting
//!
//! This crate provides the domain types shared between the wire
//! protocol (dpx-protocol) and the agent (dpxd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod peer;
pub mod record;
pub mod state;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use peer::{
    callback_path_for, validate_file_name, PeerAddress, DEFAULT_ADVERTISER_FILE_NAME,
    DEFAULT_CALLBACK_FILE_NAME, DEFAULT_SOCKET_ROOT,
};
pub use record::{MetricRecord, PortIdentity, Stat};
pub use state::SessionState;
