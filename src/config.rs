//! Configuration management for the federation daemon.
//!
//! A single TOML file with `[node]`, `[federation]` and `[logging]` sections. Every field has
//! a default so partial files load. Peer definitions live in a separate file (see
//! [`crate::store::TomlPeerStore`]).

use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier carried in heartbeats and reported in health
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.split('.').next().unwrap_or(&h).to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "federd".to_string())
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_legacy_port")]
    pub legacy_port: u16,
    #[serde(default = "default_current_port")]
    pub current_port: u16,

    /// Listener identity and client CA. Leave all three unset to run outbound-only.
    #[serde(default)]
    pub server_cert_file: Option<String>,
    #[serde(default)]
    pub server_key_file: Option<String>,
    #[serde(default)]
    pub ca_cert_file: Option<String>,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub delivery_retry_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    #[serde(default = "default_safe_datagram_size")]
    pub safe_datagram_size: usize,
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,

    #[serde(default = "default_connection_test_wait_ms")]
    pub connection_test_wait_ms: u64,

    /// TOML file holding `[[peer]]` definitions
    #[serde(default = "default_peers_file")]
    pub peers_file: String,
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_legacy_port() -> u16 {
    9000
}

fn default_current_port() -> u16 {
    9001
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_retry_interval() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    90
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_enqueue_timeout_ms() -> u64 {
    250
}

fn default_max_datagram_size() -> usize {
    65507
}

fn default_safe_datagram_size() -> usize {
    1400
}

fn default_max_envelope_size() -> usize {
    crate::network::wire::DEFAULT_MAX_ENVELOPE_SIZE
}

fn default_connection_test_wait_ms() -> u64 {
    2000
}

fn default_peers_file() -> String {
    "peers.toml".to_string()
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            legacy_port: default_legacy_port(),
            current_port: default_current_port(),
            server_cert_file: None,
            server_key_file: None,
            ca_cert_file: None,
            reconcile_interval_secs: default_reconcile_interval(),
            retry_interval_secs: default_retry_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            read_timeout_secs: default_read_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_retries: default_max_retries(),
            delivery_retry_interval_secs: default_retry_interval(),
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            max_datagram_size: default_max_datagram_size(),
            safe_datagram_size: default_safe_datagram_size(),
            max_envelope_size: default_max_envelope_size(),
            connection_test_wait_ms: default_connection_test_wait_ms(),
            peers_file: default_peers_file(),
        }
    }
}

impl FederationConfig {
    /// True when any listener credential is configured
    pub fn has_listener_credentials(&self) -> bool {
        self.server_cert_file.is_some()
            || self.server_key_file.is_some()
            || self.ca_cert_file.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    /// `stdout` or `file`
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default = "default_log_file")]
    pub file_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_log_file() -> String {
    "./logs/federd.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: default_log_file(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            source: e,
        })?;
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            federation: FederationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fed = &self.federation;

        if self.node.node_id.trim().is_empty() {
            return Err(invalid("node.node_id", "must not be empty"));
        }
        if fed.legacy_port == fed.current_port {
            return Err(invalid(
                "federation.current_port",
                format!("must differ from legacy_port ({})", fed.legacy_port),
            ));
        }
        if fed.safe_datagram_size > fed.max_datagram_size {
            return Err(invalid(
                "federation.safe_datagram_size",
                format!(
                    "{} exceeds max_datagram_size {}",
                    fed.safe_datagram_size, fed.max_datagram_size
                ),
            ));
        }
        if fed.max_datagram_size > 65507 {
            return Err(invalid(
                "federation.max_datagram_size",
                "must not exceed 65507 bytes",
            ));
        }
        if fed.queue_capacity == 0 {
            return Err(invalid("federation.queue_capacity", "must be at least 1"));
        }
        if fed.max_retries == 0 {
            return Err(invalid("federation.max_retries", "must be at least 1"));
        }
        for (field, value) in [
            ("federation.reconcile_interval_secs", fed.reconcile_interval_secs),
            ("federation.heartbeat_interval_secs", fed.heartbeat_interval_secs),
            ("federation.connect_timeout_secs", fed.connect_timeout_secs),
            ("federation.io_timeout_secs", fed.io_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if fed.read_timeout_secs <= fed.heartbeat_interval_secs {
            return Err(invalid(
                "federation.read_timeout_secs",
                "must be longer than heartbeat_interval_secs",
            ));
        }
        let creds = [
            &fed.server_cert_file,
            &fed.server_key_file,
            &fed.ca_cert_file,
        ];
        if fed.has_listener_credentials() && creds.iter().any(|c| c.is_none()) {
            return Err(invalid(
                "federation.server_cert_file",
                "server_cert_file, server_key_file and ca_cert_file must be set together",
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(invalid("logging.format", "expected \"pretty\" or \"json\""));
        }
        if !matches!(self.logging.output.as_str(), "stdout" | "file") {
            return Err(invalid("logging.output", "expected \"stdout\" or \"file\""));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            node_id = "fed-east"

            [federation]
            current_port = 9101
            "#,
        )
        .unwrap();
        assert_eq!(config.node.node_id, "fed-east");
        assert_eq!(config.federation.legacy_port, 9000);
        assert_eq!(config.federation.current_port, 9101);
        assert_eq!(config.federation.max_retries, 5);
        assert_eq!(config.federation.safe_datagram_size, 1400);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federd.toml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.node.node_id = "fed-west".to_string();
        config.save_to_file(path).unwrap();

        let loaded = Config::load_from_file(path).unwrap();
        assert_eq!(loaded.node.node_id, "fed-west");
        assert_eq!(loaded.federation.peers_file, "peers.toml");
    }

    #[test]
    fn test_validate_rejects_impossible_values() {
        let mut config = Config::default();
        config.federation.safe_datagram_size = 70000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "federation.safe_datagram_size",
                ..
            })
        ));

        let mut config = Config::default();
        config.federation.current_port = config.federation.legacy_port;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.federation.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.federation.ca_cert_file = Some("ca.pem".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        assert!(matches!(
            Config::load_from_file("/nonexistent/federd.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
