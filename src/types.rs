//! Shared data model: peer definitions, change records and runtime status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Peer identity. Peer names are unique in the configuration store, so the name is the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP, optionally wrapped in TLS
    Stream,
    /// UDP, always plaintext
    Datagram,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("OUTBOUND"),
            Direction::Inbound => f.write_str("INBOUND"),
        }
    }
}

/// Federation protocol variant. Both variants share framing and handshake; the tag only
/// travels alongside the session so divergence can be added without touching the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Legacy,
    #[default]
    Current,
}

impl ProtocolVariant {
    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolVariant::Legacy => 9000,
            ProtocolVariant::Current => 9001,
        }
    }

    pub fn all() -> [ProtocolVariant; 2] {
        [ProtocolVariant::Legacy, ProtocolVariant::Current]
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::Legacy => f.write_str("legacy"),
            ProtocolVariant::Current => f.write_str("current"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A federated peer as held by the external configuration store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDefinition {
    pub name: String,
    /// Remote node identifier; for inbound peers this matches the certificate common name.
    #[serde(default)]
    pub node_id: Option<String>,

    pub address: String,
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub protocol_variant: ProtocolVariant,

    #[serde(default = "default_true")]
    pub require_encryption: bool,
    #[serde(default = "default_true")]
    pub verify_peer: bool,
    #[serde(default)]
    pub ca_certificate: Option<String>,
    #[serde(default)]
    pub local_certificate: Option<String>,
    #[serde(default)]
    pub local_private_key: Option<String>,

    #[serde(default = "default_true")]
    pub sync_missions: bool,
    #[serde(default = "default_true")]
    pub sync_cot: bool,
    /// Ordered glob patterns; empty matches every mission.
    #[serde(default)]
    pub mission_filter: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_transport() -> TransportKind {
    TransportKind::Stream
}

fn default_direction() -> Direction {
    Direction::Outbound
}

impl PeerDefinition {
    pub fn id(&self) -> PeerId {
        PeerId::new(self.name.clone())
    }

    pub fn socket_addr_string(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Peers the reconciliation loop is responsible for dialing (or binding, for datagram).
    pub fn is_dialable(&self) -> bool {
        self.direction == Direction::Outbound || self.transport == TransportKind::Datagram
    }
}

/// Mutable runtime status of a peer, owned by the federation core while sessions are live.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub state: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Kind of mission mutation carried by a change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    CreateMission,
    DeleteMission,
    AddContent,
    RemoveContent,
    Other(String),
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::CreateMission => "CREATE_MISSION",
            ChangeKind::DeleteMission => "DELETE_MISSION",
            ChangeKind::AddContent => "ADD_CONTENT",
            ChangeKind::RemoveContent => "REMOVE_CONTENT",
            ChangeKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CREATE_MISSION" => ChangeKind::CreateMission,
            "DELETE_MISSION" => ChangeKind::DeleteMission,
            "ADD_CONTENT" => ChangeKind::AddContent,
            "REMOVE_CONTENT" => ChangeKind::RemoveContent,
            other => ChangeKind::Other(other.to_string()),
        }
    }
}

/// The wire-level content of one mission change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionChange {
    /// Stable identifier used for idempotent delivery and dedup on apply
    pub change_id: String,
    pub mission_name: String,
    pub kind: ChangeKind,
    pub creator_uid: String,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

/// A single mission mutation event, local or federated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change: MissionChange,
    pub origin_is_federated: bool,
}

impl ChangeRecord {
    pub fn local(change: MissionChange) -> Self {
        Self {
            change,
            origin_is_federated: false,
        }
    }

    pub fn federated(change: MissionChange) -> Self {
        Self {
            change,
            origin_is_federated: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.change.change_id
    }

    pub fn mission_name(&self) -> &str {
        &self.change.mission_name
    }
}
