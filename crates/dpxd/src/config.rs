//! Agent configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables. Command-line overrides are applied by the binary
//! on top of the result.
//!
//! ```toml
//! socket_root = "/var/run/dpdk"
//! poll_interval_secs = 5
//! metrics_addr = "0.0.0.0:8000"
//! sockets = ["/var/run/dpdk/rte/telemetry"]
//! ```

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use dpx_core::{
    validate_file_name, DEFAULT_ADVERTISER_FILE_NAME, DEFAULT_CALLBACK_FILE_NAME,
    DEFAULT_SOCKET_ROOT,
};
use dpx_protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DPX_CONFIG";
/// Environment override for `socket_root`.
pub const SOCKET_ROOT_ENV: &str = "DPX_SOCKET_ROOT";
/// Environment override for `metrics_addr`.
pub const METRICS_ADDR_ENV: &str = "DPX_METRICS_ADDR";
/// Environment override for `poll_interval_secs`.
pub const POLL_INTERVAL_ENV: &str = "DPX_POLL_INTERVAL_SECS";

/// Prefix added to every stat name before export.
pub const DEFAULT_STAT_PREFIX: &str = "dpdk_port_";
/// Exposition endpoint address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8000";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Directory scanned for runtime instances
    pub socket_root: PathBuf,
    /// File name of each instance's advertiser socket
    pub advertiser_file_name: String,
    /// File name of the callback socket bound next to it
    pub callback_file_name: String,
    /// Explicit advertiser sockets; when non-empty the root is not scanned
    pub sockets: Vec<PathBuf>,
    /// Seconds between polling cycles
    pub poll_interval_secs: u64,
    /// Seconds between callback bind attempts
    pub bind_backoff_secs: u64,
    /// Seconds to wait for the peer to connect back, and for each response
    pub peer_timeout_secs: u64,
    /// Largest accepted response in bytes
    pub max_message_size: usize,
    /// Prefix for exported stat names
    pub stat_prefix: String,
    /// Address of the `/metrics` endpoint
    pub metrics_addr: SocketAddr,
    /// `nodename` label; defaults to the host name
    pub node_name: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_root: PathBuf::from(DEFAULT_SOCKET_ROOT),
            advertiser_file_name: DEFAULT_ADVERTISER_FILE_NAME.to_string(),
            callback_file_name: DEFAULT_CALLBACK_FILE_NAME.to_string(),
            sockets: Vec::new(),
            poll_interval_secs: 5,
            bind_backoff_secs: 5,
            peer_timeout_secs: 2,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stat_prefix: DEFAULT_STAT_PREFIX.to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            node_name: None,
        }
    }
}

impl AgentConfig {
    /// Loads configuration from `path` (or `$DPX_CONFIG`), then applies
    /// environment overrides and validates the result.
    ///
    /// A missing `path` with no `$DPX_CONFIG` set yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let file = path.map(Path::to_path_buf).or(env_path);

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file. Unspecified fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(SOCKET_ROOT_ENV) {
            self.socket_root = PathBuf::from(root);
        }

        if let Some(addr) = lookup(METRICS_ADDR_ENV) {
            self.metrics_addr = addr.parse().map_err(|_| ConfigError::InvalidEnv {
                name: METRICS_ADDR_ENV,
                value: addr.clone(),
            })?;
        }

        if let Some(secs) = lookup(POLL_INTERVAL_ENV) {
            self.poll_interval_secs = secs.parse().map_err(|_| ConfigError::InvalidEnv {
                name: POLL_INTERVAL_ENV,
                value: secs.clone(),
            })?;
        }

        Ok(())
    }

    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be > 0".into()));
        }
        if self.bind_backoff_secs == 0 {
            return Err(ConfigError::Invalid("bind_backoff_secs must be > 0".into()));
        }
        if self.peer_timeout_secs == 0 {
            return Err(ConfigError::Invalid("peer_timeout_secs must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be > 0".into()));
        }

        validate_file_name(&self.advertiser_file_name)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        validate_file_name(&self.callback_file_name)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.advertiser_file_name == self.callback_file_name {
            return Err(ConfigError::Invalid(format!(
                "advertiser and callback file names must differ (both '{}')",
                self.callback_file_name
            )));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn bind_backoff(&self) -> Duration {
        Duration::from_secs(self.bind_backoff_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.socket_root, PathBuf::from("/var/run/dpdk"));
        assert_eq!(config.advertiser_file_name, "telemetry");
        assert_eq!(config.callback_file_name, ".client");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.bind_backoff(), Duration::from_secs(5));
        assert_eq!(config.peer_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_message_size, 200_000);
        assert_eq!(config.stat_prefix, "dpdk_port_");
        assert_eq!(config.metrics_addr.to_string(), DEFAULT_METRICS_ADDR);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            socket_root = "/tmp/dpdk"
            poll_interval_secs = 10
            sockets = ["/tmp/dpdk/a/telemetry"]
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_root, PathBuf::from("/tmp/dpdk"));
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.sockets.len(), 1);
        assert_eq!(config.peer_timeout_secs, 2);
    }

    #[test]
    fn test_unknown_toml_field_rejected() {
        assert!(AgentConfig::from_toml("socket_rot = \"/x\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (SOCKET_ROOT_ENV, "/srv/dpdk"),
            (METRICS_ADDR_ENV, "127.0.0.1:9100"),
            (POLL_INTERVAL_ENV, "15"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.socket_root, PathBuf::from("/srv/dpdk"));
        assert_eq!(config.metrics_addr.port(), 9100);
        assert_eq!(config.poll_interval_secs, 15);
    }

    #[test]
    fn test_env_invalid_value() {
        let mut config = AgentConfig::default();
        let err = config
            .apply_env(|name| (name == POLL_INTERVAL_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name, .. } if name == POLL_INTERVAL_ENV));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = AgentConfig {
            peer_timeout_secs: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            poll_interval_secs: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_same_file_names() {
        let config = AgentConfig {
            callback_file_name: "telemetry".to_string(),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nested_file_name() {
        let config = AgentConfig {
            callback_file_name: "sub/.client".to_string(),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = AgentConfig::from_file(Path::new("/nonexistent/dpx.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpx.toml");
        std::fs::write(&path, "peer_timeout_secs = 3\nnode_name = \"edge-1\"\n").unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.peer_timeout(), Duration::from_secs(3));
        assert_eq!(config.node_name.as_deref(), Some("edge-1"));
    }
}
