//! Federation service: the single owner of every peer connection and listener in the
//! process. A periodic reconciliation pass brings live sessions in line with the peer
//! definitions held by the configuration store; local changes are routed into per-peer
//! queues and changes arriving from peers are persisted and fanned out locally.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delivery::{DeliveryLedger, DeliveryRecord, PeerQueue, QueuedItem};
use crate::error::FederationError;
use crate::health::{FederationHealth, ListenerHealth, PeerCounters, PeerHealth};
use crate::mission_filter::MissionFilter;
use crate::network::client::{ConnectionTestReport, DialerSettings, OutboundDialer};
use crate::network::peer_connection::{
    PeerConnection, SessionContext, SessionHooks, SessionInfo, SessionOutcome,
};
use crate::network::peer_connection_registry::PeerConnectionRegistry;
use crate::network::server::{AcceptedSession, InboundHandler, InboundListener};
use crate::network::tls::{self, CredentialMaterial};
use crate::network::transport::StreamTransport;
use crate::store::{LocalFanout, MissionStore, PeerConfigStore};
use crate::types::{
    ChangeRecord, ConnectionStatus, Direction, MissionChange, PeerDefinition, PeerId, PeerStatus,
    ProtocolVariant, TransportKind,
};

/// Process-wide listener identity and the CA that client certificates must chain to
#[derive(Clone, Debug)]
pub struct ListenerCredentials {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Clone, Debug)]
pub struct FederationSettings {
    pub node_id: String,
    pub enabled: bool,
    pub bind_address: String,
    pub legacy_port: u16,
    pub current_port: u16,
    /// `None` runs the service outbound-only
    pub listener_credentials: Option<ListenerCredentials>,
    pub reconcile_interval: Duration,
    /// Minimum gap between dial attempts to the same peer
    pub retry_interval: Duration,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_retries: u32,
    pub delivery_retry_interval: Duration,
    pub sweep_interval: Duration,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub max_envelope_size: usize,
    pub connection_test_wait: Duration,
    pub shutdown_timeout: Duration,
    pub dialer: DialerSettings,
}

impl FederationSettings {
    pub fn from_config(config: &Config) -> Self {
        let fed = &config.federation;
        let listener_credentials = match (&fed.ca_cert_file, &fed.server_cert_file, &fed.server_key_file) {
            (Some(ca), Some(cert), Some(key)) => Some(ListenerCredentials {
                ca_file: PathBuf::from(ca),
                cert_file: PathBuf::from(cert),
                key_file: PathBuf::from(key),
            }),
            _ => None,
        };
        let delivery_retry_interval = Duration::from_secs(fed.delivery_retry_interval_secs);

        Self {
            node_id: config.node.node_id.clone(),
            enabled: fed.enabled,
            bind_address: fed.bind_address.clone(),
            legacy_port: fed.legacy_port,
            current_port: fed.current_port,
            listener_credentials,
            reconcile_interval: Duration::from_secs(fed.reconcile_interval_secs.max(1)),
            retry_interval: Duration::from_secs(fed.retry_interval_secs),
            heartbeat_interval: Duration::from_secs(fed.heartbeat_interval_secs.max(1)),
            handshake_timeout: Duration::from_secs(fed.handshake_timeout_secs.max(1)),
            max_retries: fed.max_retries,
            delivery_retry_interval,
            sweep_interval: delivery_retry_interval
                .clamp(Duration::from_millis(100), Duration::from_secs(1)),
            queue_capacity: fed.queue_capacity,
            enqueue_timeout: Duration::from_millis(fed.enqueue_timeout_ms),
            max_envelope_size: fed.max_envelope_size,
            connection_test_wait: Duration::from_millis(fed.connection_test_wait_ms),
            shutdown_timeout: Duration::from_secs(10),
            dialer: DialerSettings {
                connect_timeout: Duration::from_secs(fed.connect_timeout_secs),
                io_timeout: Duration::from_secs(fed.io_timeout_secs),
                read_timeout: Duration::from_secs(fed.read_timeout_secs),
                safe_datagram_size: fed.safe_datagram_size,
                max_datagram_size: fed.max_datagram_size,
                bind_address: fed.bind_address.clone(),
            },
        }
    }

    pub fn port(&self, variant: ProtocolVariant) -> u16 {
        match variant {
            ProtocolVariant::Legacy => self.legacy_port,
            ProtocolVariant::Current => self.current_port,
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn compile_filter(def: &PeerDefinition) -> Option<MissionFilter> {
    match MissionFilter::compile(&def.mission_filter) {
        Ok(filter) => Some(filter),
        Err(e) => {
            error!(
                "❌ Invalid mission filter for {}: {}; no missions will be sent to it",
                def.name, e
            );
            None
        }
    }
}

/// Fields a running session was built from; changing any of them forces a new session
fn session_settings_changed(old: &PeerDefinition, new: &PeerDefinition) -> bool {
    old.address != new.address
        || old.port != new.port
        || old.transport != new.transport
        || old.direction != new.direction
        || old.protocol_variant != new.protocol_variant
        || old.require_encryption != new.require_encryption
        || old.verify_peer != new.verify_peer
        || old.ca_certificate != new.ca_certificate
        || old.local_certificate != new.local_certificate
        || old.local_private_key != new.local_private_key
        || old.sync_cot != new.sync_cot
}

/// Runtime state the service keeps per peer across sessions
struct PeerRuntime {
    definition: PeerDefinition,
    /// `None` when the configured patterns do not compile
    filter: Option<MissionFilter>,
    ad_hoc: bool,
    queue: PeerQueue,
    counters: Arc<PeerCounters>,
    status: PeerStatus,
    current_session: Option<u64>,
    last_closed_session: Option<u64>,
    dial_attempts: u32,
    next_attempt: Option<Instant>,
    next_retry_at: Option<DateTime<Utc>>,
    dial_task: Option<JoinHandle<()>>,
}

impl PeerRuntime {
    fn new(definition: PeerDefinition, ad_hoc: bool, queue_capacity: usize) -> Self {
        Self {
            filter: compile_filter(&definition),
            definition,
            ad_hoc,
            queue: PeerQueue::new(queue_capacity),
            counters: Arc::new(PeerCounters::default()),
            status: PeerStatus::default(),
            current_session: None,
            last_closed_session: None,
            dial_attempts: 0,
            next_attempt: None,
            next_retry_at: None,
            dial_task: None,
        }
    }

    fn is_dialing(&self) -> bool {
        self.dial_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn schedule_retry(&mut self, interval: Duration) {
        self.next_attempt = Some(Instant::now() + interval);
        self.next_retry_at =
            Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()));
    }

    fn clear_retry(&mut self) {
        self.next_attempt = None;
        self.next_retry_at = None;
    }

    fn accepts_mission(&self, mission_name: &str) -> bool {
        self.filter
            .as_ref()
            .is_some_and(|filter| filter.matches(mission_name))
    }
}

enum InboundMatch {
    Known(PeerDefinition),
    Disabled(String),
    Unknown,
}

struct ServiceInner {
    settings: FederationSettings,
    peer_store: Arc<dyn PeerConfigStore>,
    mission_store: Arc<dyn MissionStore>,
    fanout: Arc<dyn LocalFanout>,
    dialer: OutboundDialer,
    registry: PeerConnectionRegistry,
    ledger: Arc<DeliveryLedger>,
    peers: DashMap<PeerId, PeerRuntime>,
    listeners: Mutex<Vec<Arc<InboundListener>>>,
    rejected: Arc<AtomicU64>,
    cancel: CancellationToken,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    me: Weak<ServiceInner>,
}

/// Handle to the federation core. Cheap to clone; every clone drives the same instance.
#[derive(Clone)]
pub struct FederationService {
    inner: Arc<ServiceInner>,
}

impl FederationService {
    pub fn new(
        settings: FederationSettings,
        peer_store: Arc<dyn PeerConfigStore>,
        mission_store: Arc<dyn MissionStore>,
        fanout: Arc<dyn LocalFanout>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| ServiceInner {
            dialer: OutboundDialer::new(settings.dialer.clone()),
            ledger: Arc::new(DeliveryLedger::new(
                settings.max_retries,
                settings.delivery_retry_interval,
            )),
            settings,
            peer_store,
            mission_store,
            fanout,
            registry: PeerConnectionRegistry::new(),
            peers: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            rejected: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            reconcile_task: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            me: me.clone(),
        });
        Self { inner }
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.inner.settings
    }

    /// Bind both protocol-variant listeners and start the reconciliation loop. Listener
    /// bind and credential failures are fatal and returned; nothing per-peer is.
    pub async fn start(&self) -> Result<(), FederationError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(FederationError::AlreadyStarted);
        }
        let settings = &self.inner.settings;
        if !settings.enabled {
            info!("⏸️ Federation disabled; no listeners started and no peers dialed");
            return Ok(());
        }

        match &settings.listener_credentials {
            Some(credentials) => self.start_listeners(credentials).await?,
            None => warn!(
                "⚠️ No listener credentials configured; running outbound-only (inbound federation disabled)"
            ),
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.reconcile_loop().await });
        *self.inner.reconcile_task.lock() = Some(task);

        info!(
            "🚀 Federation service started for node {} (reconcile every {:?})",
            settings.node_id, settings.reconcile_interval
        );
        Ok(())
    }

    async fn start_listeners(&self, credentials: &ListenerCredentials) -> Result<(), FederationError> {
        let settings = &self.inner.settings;
        let config = {
            let material = load_listener_material(credentials)?;
            tls::build_server_config(&material)?
        };
        let acceptor = TlsAcceptor::from(config);
        let handler: Arc<dyn InboundHandler> = self.inner.clone();

        let mut started: Vec<Arc<InboundListener>> = Vec::new();
        for variant in ProtocolVariant::all() {
            let addr = join_host_port(&settings.bind_address, settings.port(variant));
            let listener = Arc::new(InboundListener::new(
                variant,
                addr.clone(),
                acceptor.clone(),
                settings.handshake_timeout,
                handler.clone(),
                self.inner.rejected.clone(),
            ));
            if let Err(source) = listener.start(&self.inner.cancel).await {
                for running in &started {
                    running.stop().await;
                }
                return Err(FederationError::Bind {
                    variant,
                    addr,
                    source,
                });
            }
            started.push(listener);
        }

        *self.inner.listeners.lock() = started;
        Ok(())
    }

    /// One reconciliation pass. The loop started by [`start`](Self::start) calls this on
    /// every tick; it is public so callers can force a pass.
    pub async fn reconcile_once(&self) {
        self.inner.reconcile().await;
    }

    /// Route a locally created change to every eligible peer. Returns the number of peers
    /// a new delivery record was created for.
    pub async fn on_local_change(&self, record: ChangeRecord) -> usize {
        self.inner.on_local_change(record).await
    }

    /// Best-effort relay of an already encoded tactical event to connected peers with CoT
    /// sync enabled. Returns the number of peers it was queued for.
    pub fn on_local_cot(&self, raw: Bytes) -> usize {
        self.inner.on_local_cot(raw)
    }

    pub fn health(&self) -> FederationHealth {
        self.inner.health()
    }

    pub fn delivery_record(&self, peer: &str, change_id: &str) -> Option<DeliveryRecord> {
        self.inner.ledger.get(&PeerId::new(peer), change_id)
    }

    pub fn listener_addr(&self, variant: ProtocolVariant) -> Option<SocketAddr> {
        self.inner
            .listeners
            .lock()
            .iter()
            .find(|l| l.variant() == variant)
            .and_then(|l| l.local_addr())
    }

    /// Dial `def`, wait briefly, disconnect. Never touches the live session map.
    pub async fn test_connection(&self, def: &PeerDefinition) -> ConnectionTestReport {
        let settings = &self.inner.settings;
        self.inner
            .dialer
            .test_connection(
                def,
                &settings.node_id,
                settings.connection_test_wait,
                settings.heartbeat_interval,
            )
            .await
    }

    /// Stop listeners, the reconciliation loop and every session, then return. Bounded by
    /// the configured shutdown timeout. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

fn load_listener_material(
    credentials: &ListenerCredentials,
) -> Result<CredentialMaterial, FederationError> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).map_err(|source| FederationError::CredentialFile {
            path: path.display().to_string(),
            source,
        })
    };
    Ok(CredentialMaterial::new(
        Some(read(&credentials.ca_file)?),
        Some(read(&credentials.cert_file)?),
        Some(read(&credentials.key_file)?),
    ))
}

impl ServiceInner {
    async fn reconcile_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile().await,
            }
        }
        debug!("Reconciliation loop stopped");
    }

    async fn reconcile(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let definitions = match self.peer_store.list_peer_definitions().await {
            Ok(defs) => defs,
            Err(e) => {
                warn!("⚠️ Failed to list peer definitions, keeping current sessions: {}", e);
                return;
            }
        };

        let pruned = self.registry.prune_finished();
        if pruned > 0 {
            debug!("🧹 Pruned {} finished sessions", pruned);
        }

        let desired: HashSet<PeerId> = definitions.iter().map(|d| d.id()).collect();
        let mut to_stop: Vec<(Arc<PeerConnection>, &'static str)> = Vec::new();
        let mut to_dial: Vec<PeerDefinition> = Vec::new();
        let mut status_updates: Vec<(PeerId, PeerStatus)> = Vec::new();
        let now = Instant::now();

        for def in definitions {
            let peer = def.id();
            let live = self.registry.live(&peer);
            let mut rt = self
                .peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRuntime::new(def.clone(), false, self.settings.queue_capacity));

            if rt.definition != def || rt.ad_hoc {
                if let Some(conn) = &live {
                    if def.enabled && session_settings_changed(&rt.definition, &def) {
                        to_stop.push((conn.clone(), "definition changed"));
                    }
                }
                if rt.definition.mission_filter != def.mission_filter {
                    rt.filter = compile_filter(&def);
                }
                rt.definition = def.clone();
                rt.ad_hoc = false;
            }

            if !def.enabled {
                if let Some(conn) = live {
                    to_stop.push((conn, "disabled"));
                }
                rt.clear_retry();
                continue;
            }

            if !def.is_dialable() || live.is_some() || rt.is_dialing() {
                continue;
            }
            if rt.next_attempt.is_some_and(|at| now < at) {
                continue;
            }

            rt.dial_attempts += 1;
            rt.clear_retry();
            rt.status.state = ConnectionStatus::Connecting;
            status_updates.push((peer, rt.status.clone()));
            to_dial.push(def);
        }

        let removed: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|e| !e.ad_hoc && !desired.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for peer in removed {
            if let Some((_, rt)) = self.peers.remove(&peer) {
                if let Some(task) = rt.dial_task {
                    task.abort();
                }
            }
            if let Some(conn) = self.registry.get(&peer) {
                to_stop.push((conn, "removed from configuration"));
            }
            self.ledger.remove_peer(&peer);
            info!("🗑️ Peer {} removed from configuration", peer);
        }

        // ad-hoc inbound peers live only as long as their session
        let idle_ad_hoc: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|e| {
                e.ad_hoc
                    && !matches!(
                        e.status.state,
                        ConnectionStatus::Connecting | ConnectionStatus::Connected
                    )
                    && !self.registry.contains_live(e.key())
            })
            .map(|e| e.key().clone())
            .collect();
        for peer in idle_ad_hoc {
            self.peers.remove(&peer);
            debug!("🧹 Dropped ad-hoc inbound peer {}", peer);
        }

        for (conn, reason) in to_stop {
            info!(
                "🛑 [{}] Stopping session #{} to {} ({})",
                conn.info().direction,
                conn.session_id(),
                conn.peer(),
                reason
            );
            conn.stop();
        }

        for (peer, status) in status_updates {
            self.publish_status(&peer, status).await;
        }

        let Some(me) = self.me.upgrade() else {
            return;
        };
        for def in to_dial {
            let peer = def.id();
            let task = tokio::spawn(me.clone().dial_peer(def));
            if let Some(mut rt) = self.peers.get_mut(&peer) {
                rt.dial_task = Some(task);
            }
        }
    }

    async fn dial_peer(self: Arc<Self>, def: PeerDefinition) {
        let peer = def.id();
        let Some(ctx) = self.session_context(&peer, def.sync_cot) else {
            return;
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.dialer.dial(&def, ctx, &self.cancel) => r,
        };

        match result {
            Ok(conn) => self.adopt(conn).await,
            Err(e) => {
                let retry = self.settings.retry_interval;
                warn!(
                    "⚠️ [{}] Failed to connect to {}: {} (next attempt in {:?})",
                    def.direction, def.name, e, retry
                );
                let status = self.peers.get_mut(&peer).map(|mut rt| {
                    rt.schedule_retry(retry);
                    rt.status.state = ConnectionStatus::Error;
                    rt.status.last_error = Some(e.to_string());
                    rt.status.clone()
                });
                if let Some(status) = status {
                    self.publish_status(&peer, status).await;
                }
            }
        }
    }

    fn session_context(self: &Arc<Self>, peer: &PeerId, sync_cot: bool) -> Option<SessionContext> {
        let (queue, counters) = {
            let rt = self.peers.get(peer)?;
            (rt.queue.clone(), rt.counters.clone())
        };
        Some(SessionContext {
            node_id: self.settings.node_id.clone(),
            ledger: self.ledger.clone(),
            queue,
            counters,
            hooks: self.clone(),
            heartbeat_interval: self.settings.heartbeat_interval,
            sweep_interval: self.settings.sweep_interval,
            max_envelope_size: self.settings.max_envelope_size,
            sync_cot,
        })
    }

    /// Make `conn` the live session for its peer
    async fn adopt(&self, conn: Arc<PeerConnection>) {
        let peer = conn.peer().clone();
        let session_id = conn.session_id();

        if let Some(previous) = self.registry.register(conn.clone()) {
            if previous.session_id() != session_id {
                info!(
                    "🔁 [{}] Session #{} replaces #{} for {}",
                    conn.info().direction,
                    session_id,
                    previous.session_id(),
                    peer
                );
                previous.stop();
            }
        }

        let status = match self.peers.get_mut(&peer) {
            Some(mut rt) => {
                rt.current_session = Some(session_id);
                if rt.last_closed_session == Some(session_id) {
                    // ended before it could be adopted; on_closed already reported it
                    None
                } else {
                    rt.status.state = ConnectionStatus::Connected;
                    rt.status.last_connected = Some(Utc::now());
                    rt.status.last_error = None;
                    rt.clear_retry();
                    (!rt.ad_hoc).then(|| rt.status.clone())
                }
            }
            None => {
                debug!("Peer {} vanished while its session was starting", peer);
                conn.stop();
                None
            }
        };

        if let Some(status) = status {
            info!(
                "✅ [{}] {} connected (session #{})",
                conn.info().direction,
                peer,
                session_id
            );
            self.publish_status(&peer, status).await;
        }
    }

    async fn publish_status(&self, peer: &PeerId, status: PeerStatus) {
        if let Err(e) = self.peer_store.update_peer_status(peer, &status).await {
            warn!("⚠️ Failed to record status {} for {}: {}", status.state, peer, e);
        }
    }

    fn match_inbound(&self, identity: &str) -> InboundMatch {
        let mut disabled = None;
        for entry in self.peers.iter() {
            let def = &entry.definition;
            if entry.ad_hoc || def.direction != Direction::Inbound || def.transport != TransportKind::Stream {
                continue;
            }
            if def.node_id.as_deref() != Some(identity) && def.name != identity {
                continue;
            }
            if def.enabled {
                return InboundMatch::Known(def.clone());
            }
            disabled = Some(def.name.clone());
        }
        match disabled {
            Some(name) => InboundMatch::Disabled(name),
            None => InboundMatch::Unknown,
        }
    }

    async fn on_local_change(&self, record: ChangeRecord) -> usize {
        if !self.settings.enabled {
            return 0;
        }
        if record.origin_is_federated {
            debug!(
                "🔁 Change {} on {} came from federation; not forwarding",
                record.id(),
                record.mission_name()
            );
            return 0;
        }

        let record = Arc::new(record);
        let targets: Vec<(PeerId, PeerQueue)> = self
            .peers
            .iter()
            .filter(|e| {
                let def = &e.definition;
                if e.ad_hoc || !def.enabled || !def.sync_missions {
                    return false;
                }
                let accepted = e.accepts_mission(record.mission_name());
                if !accepted {
                    debug!(
                        "Mission {} excluded by filter for {}",
                        record.mission_name(),
                        def.name
                    );
                }
                accepted
            })
            .map(|e| (e.key().clone(), e.queue.clone()))
            .collect();

        let mut created = 0;
        let mut handoffs = JoinSet::new();
        for (peer, queue) in targets {
            if !self.ledger.create(&peer, record.clone()) {
                debug!("Change {} already tracked for {}", record.id(), peer);
                continue;
            }
            created += 1;
            self.ledger.mark_queued(&peer, record.id());

            let ledger = self.ledger.clone();
            let record = record.clone();
            let timeout = self.settings.enqueue_timeout;
            handoffs.spawn(async move {
                if !queue
                    .offer(QueuedItem::Change(record.clone()), timeout)
                    .await
                {
                    ledger.release_queued(&peer, record.id());
                    debug!(
                        "⏳ Queue for {} full after {:?}; change {} left for the retry sweep",
                        peer,
                        timeout,
                        record.id()
                    );
                }
            });
        }
        while handoffs.join_next().await.is_some() {}

        if created > 0 {
            debug!(
                "📤 Change {} on {} routed to {} peers",
                record.id(),
                record.mission_name(),
                created
            );
        }
        created
    }

    fn on_local_cot(&self, raw: Bytes) -> usize {
        if !self.settings.enabled {
            return 0;
        }
        let targets: Vec<(PeerId, PeerQueue)> = self
            .peers
            .iter()
            .filter(|e| !e.ad_hoc && e.definition.enabled && e.definition.sync_cot)
            .map(|e| (e.key().clone(), e.queue.clone()))
            .collect();

        let mut queued = 0;
        for (peer, queue) in targets {
            if !self.registry.contains_live(&peer) {
                continue;
            }
            if queue.try_offer(QueuedItem::Cot(raw.clone())) {
                queued += 1;
            } else {
                warn!("⚠️ Queue for {} full; dropped relayed event", peer);
            }
        }
        queued
    }

    fn health(&self) -> FederationHealth {
        let mut peers: Vec<PeerHealth> = self
            .peers
            .iter()
            .map(|e| {
                let rt = e.value();
                let conn = self.registry.live(e.key());
                PeerHealth {
                    name: rt.definition.name.clone(),
                    node_id: rt.definition.node_id.clone(),
                    direction: rt.definition.direction,
                    transport: rt.definition.transport,
                    protocol_variant: conn
                        .as_ref()
                        .map(|c| c.info().protocol_variant)
                        .unwrap_or(rt.definition.protocol_variant),
                    enabled: rt.definition.enabled,
                    ad_hoc: rt.ad_hoc,
                    state: rt.status.state,
                    last_connected: rt.status.last_connected,
                    last_error: rt.status.last_error.clone(),
                    remote_addr: conn.as_ref().map(|c| c.info().remote_addr.clone()),
                    encrypted: conn.as_ref().map(|c| c.info().encrypted),
                    deliveries: self.ledger.counts(e.key()),
                    queue_depth: rt.queue.depth(),
                    counters: rt.counters.snapshot(),
                    dial_attempts: rt.dial_attempts,
                    next_retry_at: rt.next_retry_at,
                }
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));

        let configured: Vec<&PeerHealth> = peers.iter().filter(|p| !p.ad_hoc).collect();
        let listeners = self
            .listeners
            .lock()
            .iter()
            .filter_map(|l| {
                l.local_addr().map(|addr| ListenerHealth {
                    protocol_variant: l.variant(),
                    address: addr.to_string(),
                })
            })
            .collect();

        FederationHealth {
            node_id: self.settings.node_id.clone(),
            enabled: self.settings.enabled,
            total_peers: configured.len(),
            enabled_peers: configured.iter().filter(|p| p.enabled).count(),
            connected_peers: self.registry.connected_count(),
            rejected_handshakes: self.rejected.load(Ordering::Relaxed),
            deliveries: self.ledger.totals(),
            listeners,
            peers,
        }
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Stopping federation service");
        self.cancel.cancel();

        let timeout = self.settings.shutdown_timeout;
        let drain = async {
            let reconcile = self.reconcile_task.lock().take();
            if let Some(task) = reconcile {
                let _ = task.await;
            }

            let dials: Vec<JoinHandle<()>> = self
                .peers
                .iter_mut()
                .filter_map(|mut e| e.value_mut().dial_task.take())
                .collect();
            for task in dials {
                let _ = task.await;
            }

            let listeners = std::mem::take(&mut *self.listeners.lock());
            for listener in listeners {
                listener.stop().await;
            }

            let sessions = self.registry.drain();
            for conn in &sessions {
                conn.stop();
            }
            for conn in sessions {
                conn.closed().await;
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => info!("✓ Federation service stopped"),
            Err(_) => warn!("⏱️ Federation shutdown timed out after {:?}", timeout),
        }
    }
}

#[async_trait]
impl SessionHooks for ServiceInner {
    async fn on_mission_change(&self, session: &SessionInfo, change: MissionChange) {
        let sync = self
            .peers
            .get(&session.peer)
            .map(|rt| rt.definition.sync_missions)
            .unwrap_or(true);
        if !sync {
            debug!(
                "[{}] Mission sync disabled for {}; dropped change {}",
                session.direction, session.peer, change.change_id
            );
            return;
        }

        let record = ChangeRecord::federated(change);
        match self.mission_store.apply_change(&record).await {
            Ok(true) => {
                info!(
                    "📥 [{}] Applied change {} to mission {} from {}",
                    session.direction,
                    record.id(),
                    record.mission_name(),
                    session.peer
                );
                self.fanout.publish_locally(&record).await;
            }
            Ok(false) => debug!(
                "[{}] Change {} from {} already applied",
                session.direction,
                record.id(),
                session.peer
            ),
            Err(e) => error!(
                "❌ [{}] Failed to persist change {} from {}: {}",
                session.direction,
                record.id(),
                session.peer,
                e
            ),
        }
    }

    async fn on_cot(&self, session: &SessionInfo, raw: Bytes) {
        self.fanout.publish_cot(&session.peer, raw).await;
    }

    async fn on_closed(&self, session: &SessionInfo, outcome: SessionOutcome) {
        self.registry.unregister(&session.peer, session.session_id);

        let status = self.peers.get_mut(&session.peer).and_then(|mut rt| {
            rt.last_closed_session = Some(session.session_id);
            let replaced = rt
                .current_session
                .is_some_and(|id| id != session.session_id)
                && self.registry.contains_live(&session.peer);
            if replaced {
                return None;
            }

            rt.status.state = outcome.status();
            if let SessionOutcome::Error(reason) = &outcome {
                rt.status.last_error = Some(reason.clone());
            }
            if !rt.ad_hoc && rt.definition.enabled && rt.definition.is_dialable() {
                rt.schedule_retry(self.settings.retry_interval);
            }
            (!rt.ad_hoc).then(|| rt.status.clone())
        });

        if let Some(status) = status {
            self.publish_status(&session.peer, status).await;
        }
    }
}

#[async_trait]
impl InboundHandler for ServiceInner {
    async fn on_accepted(&self, accepted: AcceptedSession) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let identity = accepted.identity();
        let remote_addr = accepted.remote_addr;
        let variant = accepted.protocol_variant;

        let def = match self.match_inbound(&identity) {
            InboundMatch::Known(def) => def,
            InboundMatch::Disabled(name) => {
                warn!(
                    "🚫 [INBOUND] {} from {} matches disabled peer {}; closing",
                    identity, remote_addr, name
                );
                return;
            }
            InboundMatch::Unknown => {
                let def = PeerDefinition {
                    name: format!("inbound:{}", identity),
                    node_id: Some(identity.clone()),
                    address: remote_addr.ip().to_string(),
                    port: remote_addr.port(),
                    transport: TransportKind::Stream,
                    direction: Direction::Inbound,
                    protocol_variant: variant,
                    require_encryption: true,
                    verify_peer: true,
                    ca_certificate: None,
                    local_certificate: None,
                    local_private_key: None,
                    sync_missions: true,
                    sync_cot: false,
                    mission_filter: Vec::new(),
                    enabled: true,
                };
                info!(
                    "🆕 [INBOUND] No peer definition for {}; tracking it as {}",
                    identity, def.name
                );
                self.peers.entry(def.id()).or_insert_with(|| {
                    PeerRuntime::new(def.clone(), true, self.settings.queue_capacity)
                });
                def
            }
        };

        if def.protocol_variant != variant {
            debug!(
                "[INBOUND] {} is configured for the {} variant but connected on the {} listener",
                def.name, def.protocol_variant, variant
            );
        }

        let peer = def.id();
        let status = self.peers.get_mut(&peer).and_then(|mut rt| {
            rt.status.state = ConnectionStatus::Connecting;
            (!rt.ad_hoc).then(|| rt.status.clone())
        });
        if let Some(status) = status {
            self.publish_status(&peer, status).await;
        }

        let Some(ctx) = me.session_context(&peer, def.sync_cot) else {
            return;
        };
        let transport = Arc::new(StreamTransport::new(
            accepted.stream,
            self.settings.dialer.io_timeout,
            self.settings.dialer.read_timeout,
        ));
        let info = SessionInfo::new(
            peer,
            Direction::Inbound,
            TransportKind::Stream,
            variant,
            remote_addr.to_string(),
            true,
        );
        let conn = PeerConnection::start(info, transport, ctx, &self.cancel);
        self.adopt(conn).await;
    }
}
