//! Prometheus exposition of collected port statistics.
//!
//! [`PrometheusSink`] turns every forwarded stat into one sample of the
//! `dpdk_exporter_total` gauge family; [`serve_metrics`] exposes the
//! family on `GET /metrics` in the text format.
//!
//! ```text
//! Poller ──record()──▶ PrometheusSink (GaugeVec) ◀──gather()── GET /metrics
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Encoding failures become a 500 response, never a crash

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dpx_core::PortIdentity;

use crate::config::AgentConfig;
use crate::sink::MetricSink;

/// Name of the exported gauge family.
pub const METRIC_NAME: &str = "dpdk_exporter_total";

/// Help text of the exported gauge family.
pub const METRIC_HELP: &str = "List of metrics related to DPDK Interface";

/// Label names, in the order values are passed to the gauge.
pub const LABELS: [&str; 5] = ["podname", "pciaddress", "namespace", "type", "nodename"];

/// Used when neither configuration nor the OS provide a host name.
pub const UNKNOWN_NODE: &str = "unknown";

/// Errors from the exposition layer.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),

    #[error("failed to bind metrics listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("metrics server failed: {0}")]
    Serve(std::io::Error),
}

// ============================================================================
// Sink
// ============================================================================

/// Stores the latest value of every stat in a Prometheus gauge.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Registry,
    gauge: GaugeVec,
    node_name: String,
}

impl PrometheusSink {
    /// Creates a sink with its own registry.
    pub fn new(node_name: impl Into<String>) -> Result<Self, ExporterError> {
        let registry = Registry::new();
        let gauge = GaugeVec::new(Opts::new(METRIC_NAME, METRIC_HELP), &LABELS)?;
        registry.register(Box::new(gauge.clone()))?;

        Ok(Self {
            registry,
            gauge,
            node_name: node_name.into(),
        })
    }

    /// Creates a sink labelled with the node name from `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, ExporterError> {
        Self::new(resolve_node_name(config))
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Renders the registry in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, ExporterError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| ExporterError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| ExporterError::Encoding(e.to_string()))
    }

    fn label_values<'a>(&'a self, identity: &'a PortIdentity, stat_name: &'a str) -> [&'a str; 5] {
        [
            identity.instance.as_str(),
            identity.address.as_str(),
            identity.namespace.as_str(),
            stat_name,
            self.node_name.as_str(),
        ]
    }
}

impl fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("metric", &METRIC_NAME)
            .field("node_name", &self.node_name)
            .finish()
    }
}

impl MetricSink for PrometheusSink {
    fn record(&self, identity: &PortIdentity, stat_name: &str, value: f64) {
        let labels = self.label_values(identity, stat_name);
        match self.gauge.get_metric_with_label_values(&labels) {
            Ok(gauge) => gauge.set(value),
            Err(e) => warn!(port = %identity, stat = stat_name, error = %e, "Dropping sample"),
        }
    }
}

/// Returns the configured node name, else the host name, else `"unknown"`.
pub fn resolve_node_name(config: &AgentConfig) -> String {
    config
        .node_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| UNKNOWN_NODE.to_string())
}

// ============================================================================
// HTTP Endpoint
// ============================================================================

/// Builds the router serving `GET /metrics`.
pub fn metrics_router(sink: Arc<PrometheusSink>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(sink)
}

async fn handle_metrics(State(sink): State<Arc<PrometheusSink>>) -> Response {
    match sink.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Binds `addr` and serves metrics until `cancel_token` fires.
pub async fn serve_metrics(
    addr: SocketAddr,
    sink: Arc<PrometheusSink>,
    cancel_token: CancellationToken,
) -> Result<(), ExporterError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ExporterError::Bind { addr, source })?;
    serve_on(listener, sink, cancel_token).await
}

/// Serves metrics on an already bound listener until `cancel_token` fires.
pub async fn serve_on(
    listener: TcpListener,
    sink: Arc<PrometheusSink>,
    cancel_token: CancellationToken,
) -> Result<(), ExporterError> {
    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "Metrics endpoint listening");
    }

    axum::serve(listener, metrics_router(sink))
        .with_graceful_shutdown(async move { cancel_token.cancelled_owned().await })
        .await
        .map_err(ExporterError::Serve)?;

    debug!("Metrics endpoint stopped");
    Ok(())
}
