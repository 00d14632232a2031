//! Collaborator seams: where peer definitions come from, where inbound changes are
//! persisted, and how they reach locally connected sessions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::mission_filter::validate_patterns;
use crate::types::{ChangeRecord, PeerDefinition, PeerId, PeerStatus};

#[async_trait]
pub trait PeerConfigStore: Send + Sync {
    /// Current definitions; edits become visible on the next call
    async fn list_peer_definitions(&self) -> Result<Vec<PeerDefinition>, StoreError>;

    async fn update_peer_status(&self, peer: &PeerId, status: &PeerStatus)
        -> Result<(), StoreError>;
}

#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Persist a change, creating its mission if needed. Returns false when the change id
    /// was already applied.
    async fn apply_change(&self, record: &ChangeRecord) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait LocalFanout: Send + Sync {
    async fn publish_locally(&self, record: &ChangeRecord);

    /// Relay a raw tactical event received from a peer
    async fn publish_cot(&self, from: &PeerId, raw: Bytes);
}

fn check_definition(def: &PeerDefinition) -> Result<(), String> {
    if def.name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    if def.address.trim().is_empty() {
        return Err("address must not be empty".to_string());
    }
    validate_patterns(&def.mission_filter).map_err(|e| format!("invalid mission filter: {}", e))?;
    if def.local_certificate.is_some() != def.local_private_key.is_some() {
        return Err("local_certificate and local_private_key must be set together".to_string());
    }
    Ok(())
}

/// Peer definitions held in memory
#[derive(Default)]
pub struct InMemoryPeerStore {
    peers: RwLock<Vec<PeerDefinition>>,
    statuses: RwLock<HashMap<PeerId, PeerStatus>>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: Vec<PeerDefinition>) -> Self {
        Self {
            peers: RwLock::new(peers),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace by name
    pub async fn upsert(&self, def: PeerDefinition) -> Result<(), StoreError> {
        check_definition(&def).map_err(|reason| StoreError::Backend(format!("{}: {}", def.name, reason)))?;
        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.name == def.name) {
            Some(existing) => *existing = def,
            None => peers.push(def),
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|p| p.name != name);
        if peers.len() == before {
            return Err(StoreError::PeerNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| StoreError::PeerNotFound(name.to_string()))?;
        peer.enabled = enabled;
        Ok(())
    }

    pub async fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.statuses.read().await.get(peer).cloned()
    }
}

#[async_trait]
impl PeerConfigStore for InMemoryPeerStore {
    async fn list_peer_definitions(&self) -> Result<Vec<PeerDefinition>, StoreError> {
        Ok(self.peers.read().await.clone())
    }

    async fn update_peer_status(
        &self,
        peer: &PeerId,
        status: &PeerStatus,
    ) -> Result<(), StoreError> {
        self.statuses
            .write()
            .await
            .insert(peer.clone(), status.clone());
        Ok(())
    }
}

#[derive(Deserialize)]
struct PeerFile {
    #[serde(default, rename = "peer")]
    peers: Vec<PeerDefinition>,
}

/// Peer definitions read from a TOML file of `[[peer]]` tables on every listing, so edits
/// take effect on the next reconciliation tick. Invalid entries are skipped and logged.
pub struct TomlPeerStore {
    path: PathBuf,
    statuses: RwLock<HashMap<PeerId, PeerStatus>>,
}

impl TomlPeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub async fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.statuses.read().await.get(peer).cloned()
    }
}

#[async_trait]
impl PeerConfigStore for TomlPeerStore {
    async fn list_peer_definitions(&self) -> Result<Vec<PeerDefinition>, StoreError> {
        let path = self.path.display().to_string();
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Peer file {} not found; no peers configured", path);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(StoreError::Load {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let file: PeerFile = toml::from_str(&contents).map_err(|e| StoreError::Load {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut seen = HashSet::new();
        let mut peers = Vec::with_capacity(file.peers.len());
        for def in file.peers {
            if let Err(reason) = check_definition(&def) {
                error!("❌ Skipping peer {:?} in {}: {}", def.name, path, reason);
                continue;
            }
            if !seen.insert(def.name.clone()) {
                error!("❌ Skipping duplicate peer {:?} in {}", def.name, path);
                continue;
            }
            peers.push(def);
        }
        Ok(peers)
    }

    async fn update_peer_status(
        &self,
        peer: &PeerId,
        status: &PeerStatus,
    ) -> Result<(), StoreError> {
        debug!("Peer {} is now {}", peer, status.state);
        self.statuses
            .write()
            .await
            .insert(peer.clone(), status.clone());
        Ok(())
    }
}

/// A mission as the in-memory store tracks it
#[derive(Clone, Debug)]
pub struct Mission {
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Created implicitly by an inbound federated change
    pub created_by_federation: bool,
    pub changes: Vec<ChangeRecord>,
}

/// Mission storage with change-id dedup
#[derive(Default)]
pub struct InMemoryMissionStore {
    missions: RwLock<HashMap<String, Mission>>,
    applied: RwLock<HashSet<String>>,
}

impl InMemoryMissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mission(&self, name: &str) -> Option<Mission> {
        self.missions.read().await.get(name).cloned()
    }

    pub async fn mission_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.missions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn change_count(&self) -> usize {
        self.applied.read().await.len()
    }
}

#[async_trait]
impl MissionStore for InMemoryMissionStore {
    async fn apply_change(&self, record: &ChangeRecord) -> Result<bool, StoreError> {
        if !self.applied.write().await.insert(record.id().to_string()) {
            return Ok(false);
        }

        let mut missions = self.missions.write().await;
        let mission = missions
            .entry(record.mission_name().to_string())
            .or_insert_with(|| {
                info!(
                    "📁 Created mission {} from {} change",
                    record.mission_name(),
                    if record.origin_is_federated { "federated" } else { "local" }
                );
                Mission {
                    name: record.mission_name().to_string(),
                    created_at: Utc::now(),
                    created_by_federation: record.origin_is_federated,
                    changes: Vec::new(),
                }
            });
        mission.changes.push(record.clone());
        Ok(true)
    }
}

/// Event delivered to local subscribers
#[derive(Clone, Debug)]
pub enum FanoutEvent {
    Change(ChangeRecord),
    Cot { from: PeerId, raw: Bytes },
}

/// Pub/Sub fan-out for in-process session code
pub struct BroadcastFanout {
    tx: broadcast::Sender<FanoutEvent>,
}

impl BroadcastFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl LocalFanout for BroadcastFanout {
    async fn publish_locally(&self, record: &ChangeRecord) {
        // No subscribers is not an error
        let _ = self.tx.send(FanoutEvent::Change(record.clone()));
    }

    async fn publish_cot(&self, from: &PeerId, raw: Bytes) {
        let _ = self.tx.send(FanoutEvent::Cot {
            from: from.clone(),
            raw,
        });
    }
}

/// Fan-out that only logs; the daemon's default when nothing subscribes in-process
pub struct LoggingFanout;

#[async_trait]
impl LocalFanout for LoggingFanout {
    async fn publish_locally(&self, record: &ChangeRecord) {
        info!(
            "📣 Federated change {} ({}) on mission {}",
            record.id(),
            record.change.kind.as_str(),
            record.mission_name()
        );
    }

    async fn publish_cot(&self, from: &PeerId, raw: Bytes) {
        debug!("📣 Relayed {} byte event from {}", raw.len(), from);
    }
}
