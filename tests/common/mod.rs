//! Shared fixtures: a throwaway PKI, fast timer settings and a peer store that keeps every
//! status update it was given.

#![allow(dead_code)]

use async_trait::async_trait;
use federd::config::Config;
use federd::federation::{FederationService, FederationSettings, ListenerCredentials};
use federd::network::tls::CertificateAuthority;
use federd::store::{
    BroadcastFanout, InMemoryMissionStore, InMemoryPeerStore, Mission, PeerConfigStore,
};
use federd::types::{
    ChangeKind, Direction, MissionChange, PeerDefinition, PeerId, PeerStatus, ProtocolVariant,
    TransportKind,
};
use federd::StoreError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Pki {
    pub ca: CertificateAuthority,
}

pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl Pki {
    pub fn new(name: &str) -> Self {
        Self {
            ca: CertificateAuthority::generate(name).unwrap(),
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca.ca_pem()
    }

    pub fn identity(&self, common_name: &str) -> Identity {
        let issued = self
            .ca
            .issue(common_name, &["127.0.0.1".to_string(), "localhost".to_string()])
            .unwrap();
        Identity {
            cert_pem: issued.cert_pem.clone(),
            key_pem: issued.key_pem.clone(),
        }
    }

    /// Listener credential files for `common_name`; keep the directory alive for the test
    pub fn listener_files(&self, common_name: &str) -> (TempDir, ListenerCredentials) {
        let dir = tempfile::tempdir().unwrap();
        let identity = self.identity(common_name);
        let credentials = ListenerCredentials {
            ca_file: dir.path().join("ca.pem"),
            cert_file: dir.path().join("server.pem"),
            key_file: dir.path().join("server.key"),
        };
        std::fs::write(&credentials.ca_file, self.ca_pem()).unwrap();
        std::fs::write(&credentials.cert_file, &identity.cert_pem).unwrap();
        std::fs::write(&credentials.key_file, &identity.key_pem).unwrap();
        (dir, credentials)
    }
}

pub fn fast_settings(node_id: &str) -> FederationSettings {
    let mut settings = FederationSettings::from_config(&Config::default());
    settings.node_id = node_id.to_string();
    settings.bind_address = "127.0.0.1".to_string();
    settings.legacy_port = 0;
    settings.current_port = 0;
    settings.listener_credentials = None;
    settings.reconcile_interval = Duration::from_millis(50);
    settings.retry_interval = Duration::from_millis(300);
    settings.heartbeat_interval = Duration::from_secs(5);
    settings.handshake_timeout = Duration::from_secs(5);
    settings.max_retries = 3;
    settings.delivery_retry_interval = Duration::from_millis(100);
    settings.sweep_interval = Duration::from_millis(50);
    settings.enqueue_timeout = Duration::from_millis(100);
    settings.connection_test_wait = Duration::from_millis(300);
    settings.shutdown_timeout = Duration::from_secs(5);
    settings.dialer.connect_timeout = Duration::from_secs(3);
    settings.dialer.io_timeout = Duration::from_secs(3);
    settings.dialer.read_timeout = Duration::from_secs(30);
    settings.dialer.bind_address = "127.0.0.1".to_string();
    settings
}

pub fn peer(name: &str, direction: Direction, transport: TransportKind, port: u16) -> PeerDefinition {
    PeerDefinition {
        name: name.to_string(),
        node_id: None,
        address: "127.0.0.1".to_string(),
        port,
        transport,
        direction,
        protocol_variant: ProtocolVariant::Current,
        require_encryption: false,
        verify_peer: true,
        ca_certificate: None,
        local_certificate: None,
        local_private_key: None,
        sync_missions: true,
        sync_cot: false,
        mission_filter: Vec::new(),
        enabled: true,
    }
}

/// Outbound stream peer presenting `identity` and trusting `pki`
pub fn mtls_peer(name: &str, port: u16, pki: &Pki, identity: &Identity) -> PeerDefinition {
    let mut def = peer(name, Direction::Outbound, TransportKind::Stream, port);
    def.require_encryption = true;
    def.ca_certificate = Some(pki.ca_pem());
    def.local_certificate = Some(identity.cert_pem.clone());
    def.local_private_key = Some(identity.key_pem.clone());
    def
}

pub fn change(id: &str, mission: &str, payload: &str) -> MissionChange {
    MissionChange {
        change_id: id.to_string(),
        mission_name: mission.to_string(),
        kind: ChangeKind::AddContent,
        creator_uid: "ANDROID-operator".to_string(),
        timestamp: chrono::Utc::now(),
        payload: payload.to_string(),
    }
}

/// Peer store that remembers every status transition
#[derive(Default)]
pub struct HistoryPeerStore {
    pub peers: InMemoryPeerStore,
    history: Mutex<Vec<(PeerId, PeerStatus)>>,
}

impl HistoryPeerStore {
    pub fn with_peers(peers: Vec<PeerDefinition>) -> Self {
        Self {
            peers: InMemoryPeerStore::with_peers(peers),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn history(&self, name: &str) -> Vec<PeerStatus> {
        self.history
            .lock()
            .iter()
            .filter(|(peer, _)| peer.as_str() == name)
            .map(|(_, status)| status.clone())
            .collect()
    }
}

#[async_trait]
impl PeerConfigStore for HistoryPeerStore {
    async fn list_peer_definitions(&self) -> Result<Vec<PeerDefinition>, StoreError> {
        self.peers.list_peer_definitions().await
    }

    async fn update_peer_status(
        &self,
        peer: &PeerId,
        status: &PeerStatus,
    ) -> Result<(), StoreError> {
        self.history.lock().push((peer.clone(), status.clone()));
        self.peers.update_peer_status(peer, status).await
    }
}

/// One federation node plus handles to its collaborators
pub struct Node {
    pub service: FederationService,
    pub peers: Arc<HistoryPeerStore>,
    pub missions: Arc<InMemoryMissionStore>,
    pub fanout: Arc<BroadcastFanout>,
}

impl Node {
    pub fn new(settings: FederationSettings, peers: Vec<PeerDefinition>) -> Self {
        let peer_store = Arc::new(HistoryPeerStore::with_peers(peers));
        let missions = Arc::new(InMemoryMissionStore::new());
        let fanout = Arc::new(BroadcastFanout::new(64));
        let service = FederationService::new(
            settings,
            peer_store.clone(),
            missions.clone(),
            fanout.clone(),
        );
        Self {
            service,
            peers: peer_store,
            missions,
            fanout,
        }
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll a mission until `check` holds for it or `timeout` passes
pub async fn wait_for_mission(
    missions: &InMemoryMissionStore,
    name: &str,
    timeout: Duration,
    check: impl Fn(&Mission) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if missions.mission(name).await.is_some_and(|m| check(&m)) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until nothing accepts connections on `port`
pub async fn wait_for_closed_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A localhost UDP port that was free a moment ago
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
