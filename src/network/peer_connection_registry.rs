use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::peer_connection::PeerConnection;
use crate::types::{ConnectionStatus, PeerId};

/// Live sessions keyed by peer. At most one session per peer.
#[derive(Default)]
pub struct PeerConnectionRegistry {
    connections: DashMap<PeerId, Arc<PeerConnection>>,
}

impl PeerConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it replaces (caller stops it)
    pub fn register(&self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let peer = conn.peer().clone();
        let session_id = conn.session_id();
        let previous = self.connections.insert(peer.clone(), conn);
        debug!("✅ Registered session #{} for {}", session_id, peer);
        previous
    }

    /// Remove the entry only if it still belongs to `session_id`
    pub fn unregister(&self, peer: &PeerId, session_id: u64) -> bool {
        let removed = self
            .connections
            .remove_if(peer, |_, conn| conn.session_id() == session_id)
            .is_some();
        if removed {
            debug!("🔌 Unregistered session #{} for {}", session_id, peer);
        }
        removed
    }

    pub fn get(&self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        self.connections.get(peer).map(|entry| entry.value().clone())
    }

    /// Live (non-terminal) session for `peer`
    pub fn live(&self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        self.get(peer).filter(|conn| !conn.is_finished())
    }

    pub fn contains_live(&self, peer: &PeerId) -> bool {
        self.live(peer).is_some()
    }

    /// Consistent copy for readers that must not hold map locks
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().status() == ConnectionStatus::Connected)
            .count()
    }

    /// Drop entries whose session already ended
    pub fn prune_finished(&self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, conn| !conn.is_finished());
        before - self.connections.len()
    }

    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        let peers: Vec<PeerId> = self.connections.iter().map(|e| e.key().clone()).collect();
        peers
            .into_iter()
            .filter_map(|peer| self.connections.remove(&peer).map(|(_, conn)| conn))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
