//! dpxd - DPDK telemetry agent
//!
//! This crate provides the agent side of the DPDK telemetry client
//! registration protocol:
//! - `locator` - discovery of advertiser sockets under the socket root
//! - `session` - the per-peer registration handshake and request channel
//! - `registry` - the set of sessions, keyed by callback path
//! - `poller` - the cycle that drives discovery, registration and polling
//! - `exporter` - Prometheus gauge sink and `/metrics` endpoint
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         dpxd agent                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────────┐  discover()  ┌──────────────────────────┐  │
//! │  │ SocketLocator │─────────────▶│  Poller                  │  │
//! │  │ (fs scan)     │              │  owns SessionRegistry    │  │
//! │  └───────────────┘              └────────────┬─────────────┘  │
//! │                                              │                │
//! │                 register() / request_snapshot()               │
//! │                                              ▼                │
//! │  ┌───────────────────────┐       ┌──────────────────────────┐ │
//! │  │ PrometheusSink        │◀──────│ Session (per peer)       │ │
//! │  │ GET /metrics (axum)   │ stats │ SOCK_SEQPACKET channels  │ │
//! │  └───────────────────────┘       └──────────────────────────┘ │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Per-peer failures are contained at the poller boundary

pub mod config;
pub mod exporter;
pub mod locator;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod session;
pub mod sink;
