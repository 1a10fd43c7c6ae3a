//! Decoded metric snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Labels identifying which port a snapshot describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortIdentity {
    /// Runtime instance label (pod name in containerized deployments)
    pub instance: String,
    /// PCI address of the port
    pub address: String,
    /// Namespace the instance runs in
    pub namespace: String,
}

impl PortIdentity {
    pub fn new(
        instance: impl Into<String>,
        address: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            address: address.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.instance, self.address)
    }
}

/// One named statistic from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub name: String,
    pub value: f64,
}

impl Stat {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A point-in-time pull of all statistics from one peer.
///
/// Produced fresh on every successful poll and never persisted. Stats keep
/// the order the peer reported them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub identity: PortIdentity,
    pub stats: Vec<Stat>,
}

impl MetricRecord {
    pub fn new(identity: PortIdentity, stats: Vec<Stat>) -> Self {
        Self { identity, stats }
    }

    /// Number of stats in the snapshot.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Looks up a stat by its unprefixed name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.stats.iter().find(|s| s.name == name).map(|s| s.value)
    }

    /// Iterates over stats with `prefix` prepended to each name.
    pub fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (String, f64)> + 'a {
        self.stats
            .iter()
            .map(move |s| (format!("{prefix}{}", s.name), s.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricRecord {
        MetricRecord::new(
            PortIdentity::new("pod-a", "0000:3b:00.0", "default"),
            vec![Stat::new("rx_good_packets", 42.0), Stat::new("tx_good_packets", 7.0)],
        )
    }

    #[test]
    fn test_prefixed_keeps_order() {
        let record = sample();
        let names: Vec<String> = record.prefixed("dpdk_port_").map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["dpdk_port_rx_good_packets", "dpdk_port_tx_good_packets"]
        );
    }

    #[test]
    fn test_get_by_name() {
        let record = sample();
        assert_eq!(record.get("rx_good_packets"), Some(42.0));
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.len(), 2);
        assert!(!record.is_empty());
    }

    #[test]
    fn test_identity_display() {
        let id = PortIdentity::new("pod-a", "0000:3b:00.0", "default");
        assert_eq!(id.to_string(), "default/pod-a@0000:3b:00.0");
    }

    #[test]
    fn test_record_serializes() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"instance\":\"pod-a\""));
        assert!(json.contains("\"name\":\"rx_good_packets\""));
    }
}
