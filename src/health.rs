//! Read-only health projection and the per-peer counters that feed it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::delivery::DeliveryCounts;
use crate::types::{ConnectionStatus, Direction, ProtocolVariant, TransportKind};

/// Traffic counters for one peer, kept across sessions.
#[derive(Default)]
pub struct PeerCounters {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    decode_errors: AtomicU64,
    last_heard: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeerCounterSnapshot {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub last_heard: Option<DateTime<Utc>>,
}

impl PeerCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Heartbeats count toward bytes only
    pub fn record_heartbeat(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_envelope(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_heard.lock() = Some(Utc::now());
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerCounterSnapshot {
        PeerCounterSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            last_heard: *self.last_heard.lock(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerHealth {
    pub name: String,
    pub node_id: Option<String>,
    pub direction: Direction,
    pub transport: TransportKind,
    pub protocol_variant: ProtocolVariant,
    pub enabled: bool,
    /// Runtime-only peer created for an unmatched inbound certificate identity
    pub ad_hoc: bool,
    pub state: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub remote_addr: Option<String>,
    pub encrypted: Option<bool>,
    pub deliveries: DeliveryCounts,
    pub queue_depth: usize,
    pub counters: PeerCounterSnapshot,
    pub dial_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ListenerHealth {
    pub protocol_variant: ProtocolVariant,
    pub address: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct FederationHealth {
    pub node_id: String,
    pub enabled: bool,
    pub total_peers: usize,
    pub enabled_peers: usize,
    pub connected_peers: usize,
    pub rejected_handshakes: u64,
    pub deliveries: DeliveryCounts,
    pub listeners: Vec<ListenerHealth>,
    pub peers: Vec<PeerHealth>,
}

impl FederationHealth {
    pub fn peer(&self, name: &str) -> Option<&PeerHealth> {
        self.peers.iter().find(|p| p.name == name)
    }
}
