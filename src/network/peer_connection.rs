//! Peer Connection Management
//! One live session per peer: a send duty, a receive duty and (stream only) a heartbeat
//! duty over a single owned transport, watched by a supervisor that tears everything down
//! on the first failure and reports the outcome exactly once.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection_state::{SessionState, SessionStateMachine};
use super::transport::{FederationTransport, Received, TransportError};
use super::wire::{self, DecodedEnvelope, Envelope, Heartbeat, StreamDecoder, WireError};
use crate::delivery::{DeliveryLedger, DeliveryState, PeerQueue, QueuedItem};
use crate::health::PeerCounters;
use crate::types::{
    ChangeRecord, ConnectionStatus, Direction, MissionChange, PeerId, ProtocolVariant,
    TransportKind,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one session. Session ids let late callbacks from a replaced session be told
/// apart from the current one.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub peer: PeerId,
    pub direction: Direction,
    pub transport: TransportKind,
    pub protocol_variant: ProtocolVariant,
    pub remote_addr: String,
    pub encrypted: bool,
}

impl SessionInfo {
    pub fn new(
        peer: PeerId,
        direction: Direction,
        transport: TransportKind,
        protocol_variant: ProtocolVariant,
        remote_addr: String,
        encrypted: bool,
    ) -> Self {
        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            direction,
            transport,
            protocol_variant,
            remote_addr,
            encrypted,
        }
    }
}

/// Final result of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Explicit stop or orderly close by the remote side
    Disconnected,
    /// Transport failure, timeout or heartbeat failure
    Error(String),
}

impl SessionOutcome {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            SessionOutcome::Disconnected => ConnectionStatus::Disconnected,
            SessionOutcome::Error(_) => ConnectionStatus::Error,
        }
    }
}

/// Callbacks from a session into whoever owns it.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// A mission change decoded from this peer
    async fn on_mission_change(&self, session: &SessionInfo, change: MissionChange);

    /// A non-mission tactical event from a peer with CoT sync enabled
    async fn on_cot(&self, session: &SessionInfo, raw: Bytes);

    /// Called exactly once per session, after the transport is closed
    async fn on_closed(&self, session: &SessionInfo, outcome: SessionOutcome);
}

/// Hooks that drop everything. Used by one-shot connectivity tests.
pub struct DetachedHooks;

#[async_trait]
impl SessionHooks for DetachedHooks {
    async fn on_mission_change(&self, _session: &SessionInfo, _change: MissionChange) {}

    async fn on_cot(&self, _session: &SessionInfo, _raw: Bytes) {}

    async fn on_closed(&self, _session: &SessionInfo, _outcome: SessionOutcome) {}
}

/// Everything a session borrows from its owner.
#[derive(Clone)]
pub struct SessionContext {
    pub node_id: String,
    pub ledger: Arc<DeliveryLedger>,
    pub queue: PeerQueue,
    pub counters: Arc<PeerCounters>,
    pub hooks: Arc<dyn SessionHooks>,
    pub heartbeat_interval: Duration,
    /// How often the send duty looks for pending records and due retries
    pub sweep_interval: Duration,
    pub max_envelope_size: usize,
    pub sync_cot: bool,
}

impl SessionContext {
    /// Context with a private queue and ledger that reports nowhere.
    pub fn detached(node_id: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            ledger: Arc::new(DeliveryLedger::new(1, Duration::from_secs(60))),
            queue: PeerQueue::new(1),
            counters: Arc::new(PeerCounters::default()),
            hooks: Arc::new(DetachedHooks),
            heartbeat_interval,
            sweep_interval: Duration::from_secs(1),
            max_envelope_size: wire::DEFAULT_MAX_ENVELOPE_SIZE,
            sync_cot: false,
        }
    }
}

#[derive(Debug)]
enum DutyExit {
    /// Cancellation observed
    Stopped,
    Eof,
    Failed(String),
}

/// A live federation session
pub struct PeerConnection {
    info: SessionInfo,
    state: Arc<SessionStateMachine>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl PeerConnection {
    /// Take ownership of an established transport and start the session's duties.
    /// `parent` cancels the session along with everything else on shutdown.
    pub fn start(
        info: SessionInfo,
        transport: Arc<dyn FederationTransport>,
        ctx: SessionContext,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let state = Arc::new(SessionStateMachine::new(format!(
            "{} #{}",
            info.peer, info.session_id
        )));
        state.mark_connected();

        let conn = Arc::new(Self {
            info,
            state,
            cancel: parent.child_token(),
            finished: CancellationToken::new(),
        });

        info!(
            "🔄 [{}] Session #{} started for {} ({}, {:?}, {}encrypted)",
            conn.info.direction,
            conn.info.session_id,
            conn.info.peer,
            conn.info.remote_addr,
            conn.info.transport,
            if conn.info.encrypted { "" } else { "not " }
        );

        tokio::spawn(supervise(
            conn.info.clone(),
            conn.state.clone(),
            transport,
            ctx,
            conn.cancel.clone(),
            conn.finished.clone(),
        ));

        conn
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn peer(&self) -> &PeerId {
        &self.info.peer
    }

    pub fn session_id(&self) -> u64 {
        self.info.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Request an orderly stop; returns immediately
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until every duty has exited and the outcome was reported
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    pub async fn stop_and_wait(&self) {
        self.stop();
        self.closed().await;
    }
}

async fn supervise(
    info: SessionInfo,
    state: Arc<SessionStateMachine>,
    transport: Arc<dyn FederationTransport>,
    ctx: SessionContext,
    cancel: CancellationToken,
    finished: CancellationToken,
) {
    let mut duties = JoinSet::new();
    duties.spawn(send_duty(
        info.clone(),
        transport.clone(),
        ctx.clone(),
        cancel.clone(),
    ));
    duties.spawn(receive_duty(
        info.clone(),
        transport.clone(),
        ctx.clone(),
        cancel.clone(),
    ));
    if transport.supports_heartbeat() {
        duties.spawn(heartbeat_duty(
            info.clone(),
            transport.clone(),
            ctx.clone(),
            cancel.clone(),
        ));
    }

    let first_exit = match duties.join_next().await {
        Some(Ok(exit)) => exit,
        Some(Err(e)) => DutyExit::Failed(format!("duty task aborted: {}", e)),
        None => DutyExit::Stopped,
    };

    cancel.cancel();
    transport.shutdown().await;
    while duties.join_next().await.is_some() {}

    let released = ctx.ledger.release_in_flight(&info.peer);
    if released > 0 {
        debug!(
            "↩️ [{}] {} interrupted deliveries for {} returned to pending",
            info.direction, released, info.peer
        );
    }

    let outcome = match first_exit {
        DutyExit::Stopped => {
            info!(
                "🔌 [{}] Session #{} to {} stopped",
                info.direction, info.session_id, info.peer
            );
            SessionOutcome::Disconnected
        }
        DutyExit::Eof => {
            info!(
                "🔌 [{}] Connection to {} closed by peer (EOF)",
                info.direction, info.peer
            );
            SessionOutcome::Disconnected
        }
        DutyExit::Failed(reason) => {
            error!(
                "❌ [{}] Session #{} to {} failed: {}",
                info.direction, info.session_id, info.peer, reason
            );
            SessionOutcome::Error(reason)
        }
    };

    match &outcome {
        SessionOutcome::Disconnected => state.mark_disconnected(),
        SessionOutcome::Error(reason) => state.mark_error(reason.clone()),
    };

    ctx.hooks.on_closed(&info, outcome).await;
    finished.cancel();
}

async fn send_duty(
    info: SessionInfo,
    transport: Arc<dyn FederationTransport>,
    ctx: SessionContext,
    cancel: CancellationToken,
) -> DutyExit {
    let receiver = ctx.queue.receiver();
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return DutyExit::Stopped,
        guard = receiver.lock_owned() => guard,
    };

    let mut sweep = interval(ctx.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return DutyExit::Stopped,
            _ = sweep.tick() => {
                for record in ctx.ledger.take_due(&info.peer, Utc::now()) {
                    if let Err(exit) = deliver(&info, transport.as_ref(), &ctx, &cancel, record).await {
                        return exit;
                    }
                }
            }
            item = rx.recv() => match item {
                Some(QueuedItem::Change(record)) => {
                    if !ctx.ledger.begin_attempt(&info.peer, record.id()) {
                        continue;
                    }
                    if let Err(exit) = deliver(&info, transport.as_ref(), &ctx, &cancel, record).await {
                        return exit;
                    }
                }
                Some(QueuedItem::Cot(raw)) => {
                    if let Err(exit) = relay(&info, transport.as_ref(), &ctx, &cancel, raw).await {
                        return exit;
                    }
                }
                None => return DutyExit::Stopped,
            },
        }
    }
}

/// One attempt for a record already claimed as in flight
async fn deliver(
    info: &SessionInfo,
    transport: &dyn FederationTransport,
    ctx: &SessionContext,
    cancel: &CancellationToken,
    record: Arc<ChangeRecord>,
) -> Result<(), DutyExit> {
    let frame = wire::encode_mission_change(&record.change);
    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(DutyExit::Stopped),
        r = transport.send(&frame) => r,
    };

    match result {
        Ok(()) => {
            ctx.ledger.mark_sent(&info.peer, record.id());
            ctx.counters.record_sent(frame.len());
            debug!(
                "📤 [{}] Sent change {} ({}) to {}",
                info.direction,
                record.id(),
                record.mission_name(),
                info.peer
            );
            Ok(())
        }
        Err(TransportError::TooLarge(e)) => {
            ctx.ledger
                .fail_permanently(&info.peer, record.id(), &e.to_string());
            ctx.counters.record_failed();
            error!(
                "❌ [{}] Change {} for {} can never be sent: {}",
                info.direction,
                record.id(),
                info.peer,
                e
            );
            Ok(())
        }
        Err(TransportError::NoRemote) => {
            // inbound datagram peer has not been heard from yet
            ctx.ledger.defer(&info.peer, record.id());
            debug!(
                "⏳ [{}] No reply address for {} yet, change {} stays pending",
                info.direction,
                info.peer,
                record.id()
            );
            Ok(())
        }
        Err(e) => {
            let state = ctx
                .ledger
                .record_failure(&info.peer, record.id(), &e.to_string());
            if state == DeliveryState::Failed {
                ctx.counters.record_failed();
                error!(
                    "❌ [{}] Delivery of change {} to {} permanently failed after {} attempts: {}",
                    info.direction,
                    record.id(),
                    info.peer,
                    ctx.ledger.max_retries(),
                    e
                );
            } else {
                warn!(
                    "⚠️ [{}] Failed to send change {} to {}, will retry: {}",
                    info.direction,
                    record.id(),
                    info.peer,
                    e
                );
            }
            if e.is_fatal() {
                Err(DutyExit::Failed(e.to_string()))
            } else {
                Ok(())
            }
        }
    }
}

/// Best-effort relay of a raw tactical event
async fn relay(
    info: &SessionInfo,
    transport: &dyn FederationTransport,
    ctx: &SessionContext,
    cancel: &CancellationToken,
    raw: Bytes,
) -> Result<(), DutyExit> {
    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(DutyExit::Stopped),
        r = transport.send(&raw) => r,
    };
    match result {
        Ok(()) => {
            ctx.counters.record_sent(raw.len());
            Ok(())
        }
        Err(e) => {
            ctx.counters.record_failed();
            warn!(
                "⚠️ [{}] Dropped relayed event for {}: {}",
                info.direction, info.peer, e
            );
            if e.is_fatal() {
                Err(DutyExit::Failed(e.to_string()))
            } else {
                Ok(())
            }
        }
    }
}

async fn receive_duty(
    info: SessionInfo,
    transport: Arc<dyn FederationTransport>,
    ctx: SessionContext,
    cancel: CancellationToken,
) -> DutyExit {
    let mut decoder = StreamDecoder::new(ctx.max_envelope_size);

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return DutyExit::Stopped,
            r = transport.recv() => r,
        };

        match received {
            Ok(Received::Chunk(bytes)) => {
                ctx.counters.record_bytes_received(bytes.len());
                decoder.extend(&bytes);
                while let Some(result) = decoder.next_envelope() {
                    handle_envelope(&info, &ctx, result).await;
                }
            }
            Ok(Received::Datagram(bytes)) => {
                ctx.counters.record_bytes_received(bytes.len());
                handle_envelope(&info, &ctx, wire::decode_datagram(&bytes)).await;
            }
            Ok(Received::Eof) => return DutyExit::Eof,
            Err(e) if e.is_fatal() => return DutyExit::Failed(e.to_string()),
            Err(e) => {
                debug!(
                    "[{}] Ignoring datagram receive error from {}: {}",
                    info.direction, info.peer, e
                );
            }
        }
    }
}

async fn handle_envelope(
    info: &SessionInfo,
    ctx: &SessionContext,
    result: Result<DecodedEnvelope, WireError>,
) {
    let decoded = match result {
        Ok(decoded) => decoded,
        Err(e) => {
            ctx.counters.record_decode_error();
            warn!(
                "⚠️ [{}] Dropped malformed envelope from {}: {}",
                info.direction, info.peer, e
            );
            return;
        }
    };

    ctx.counters.record_envelope();
    match decoded.envelope {
        Envelope::MissionChange(change) => {
            debug!(
                "📥 [{}] Change {} for mission {} from {}",
                info.direction, change.change_id, change.mission_name, info.peer
            );
            ctx.hooks.on_mission_change(info, change).await;
        }
        Envelope::Heartbeat(hb) => {
            debug!(
                "💓 [{}] Heartbeat from {} (node {})",
                info.direction, info.peer, hb.node_id
            );
        }
        Envelope::Other { uid, cot_type } => {
            if ctx.sync_cot {
                ctx.hooks.on_cot(info, decoded.raw).await;
            } else {
                debug!(
                    "[{}] Ignoring event {} ({}) from {}",
                    info.direction, uid, cot_type, info.peer
                );
            }
        }
    }
}

async fn heartbeat_duty(
    info: SessionInfo,
    transport: Arc<dyn FederationTransport>,
    ctx: SessionContext,
    cancel: CancellationToken,
) -> DutyExit {
    let mut ticker = interval_at(
        Instant::now() + ctx.heartbeat_interval,
        ctx.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return DutyExit::Stopped,
            _ = ticker.tick() => {
                let frame = wire::encode_heartbeat(&Heartbeat::now(ctx.node_id.clone()));
                let result = tokio::select! {
                    _ = cancel.cancelled() => return DutyExit::Stopped,
                    r = transport.send(&frame) => r,
                };
                match result {
                    Ok(()) => ctx.counters.record_heartbeat(frame.len()),
                    Err(e) => {
                        warn!(
                            "💔 [{}] Heartbeat to {} failed on session #{}: {}",
                            info.direction, info.peer, info.session_id, e
                        );
                        return DutyExit::Failed(format!("heartbeat failed: {}", e));
                    }
                }
            }
        }
    }
}
