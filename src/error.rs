use thiserror::Error;

use crate::network::client::ConnectError;
use crate::network::tls::TlsError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Connection test failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures fatal to the federation service's startup; everything per-peer is reported as
/// status instead.
#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Failed to bind {variant} listener on {addr}: {source}")]
    Bind {
        variant: crate::types::ProtocolVariant,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load listener certificate material: {0}")]
    Credentials(#[from] TlsError),

    #[error("Failed to read {path}: {source}")]
    CredentialFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Federation service already started")]
    AlreadyStarted,
}

/// Errors surfaced by external collaborators (configuration store, mission store).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Failed to read peer definitions from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}
