//! dpx Protocol - Message shapes for the telemetry client protocol
//!
//! This crate provides the control messages the agent sends to a runtime
//! instance (register, unregister, snapshot request) and the decoding of
//! the snapshot response into a [`dpx_core::MetricRecord`].
//!
//! The transport preserves message boundaries, so every message is a
//! single JSON document with no framing around it.

pub mod message;
pub mod snapshot;

pub use message::{Action, ClientData, Command, ControlMessage};
pub use snapshot::{
    decode_snapshot, DecodeError, DecodedSnapshot, PortSnapshot, RawStat, SnapshotResponse,
    DEFAULT_MAX_MESSAGE_SIZE,
};
