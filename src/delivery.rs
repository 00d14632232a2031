//! Outbound delivery bookkeeping: one record per (peer, change) and the bounded per-peer
//! queue that feeds a peer connection's send duty.
//!
//! Record lifecycle:
//! `Pending -> Queued -> InFlight -> Sent` on success, or
//! `InFlight -> RetryScheduled -> InFlight ...` until `max_retries` failures, then `Failed`.
//! `Sent` and `Failed` are terminal. A record is `InFlight` for at most one attempt at a time.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::{ChangeRecord, PeerId};

const MAX_ERROR_LEN: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DeliveryState {
    /// Created but not handed to the peer queue (queue full or peer offline)
    Pending,
    /// Sitting in the peer queue
    Queued,
    InFlight,
    RetryScheduled { not_before: DateTime<Utc> },
    Sent,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryRecord {
    pub peer: PeerId,
    pub record: Arc<ChangeRecord>,
    pub state: DeliveryState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryCounts {
    /// Everything not yet terminal
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

type LedgerKey = (PeerId, String);

#[derive(Default)]
struct LedgerInner {
    records: HashMap<LedgerKey, DeliveryRecord>,
    next_seq: u64,
}

/// Per (peer, change) delivery records. All methods are synchronous and never held across
/// an await.
pub struct DeliveryLedger {
    inner: Mutex<LedgerInner>,
    max_retries: u32,
    retry_interval: chrono::Duration,
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

impl DeliveryLedger {
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            max_retries: max_retries.max(1),
            retry_interval: chrono::Duration::from_std(retry_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Create the record for `(peer, change)`. Returns false if one already exists, whatever
    /// its state.
    pub fn create(&self, peer: &PeerId, record: Arc<ChangeRecord>) -> bool {
        let mut inner = self.inner.lock();
        let key = (peer.clone(), record.id().to_string());
        if inner.records.contains_key(&key) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            key,
            DeliveryRecord {
                peer: peer.clone(),
                record,
                state: DeliveryState::Pending,
                attempts: 0,
                created_at: Utc::now(),
                last_attempt_at: None,
                sent_at: None,
                last_error: None,
                seq,
            },
        );
        true
    }

    fn with_record<R>(
        &self,
        peer: &PeerId,
        change_id: &str,
        f: impl FnOnce(&mut DeliveryRecord) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        inner
            .records
            .get_mut(&(peer.clone(), change_id.to_string()))
            .map(f)
    }

    /// `Pending -> Queued` once the record is in the peer queue
    pub fn mark_queued(&self, peer: &PeerId, change_id: &str) -> bool {
        self.with_record(peer, change_id, |r| {
            if r.state == DeliveryState::Pending {
                r.state = DeliveryState::Queued;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// `Queued -> Pending` when the hand-off to the peer queue timed out; the sweep picks it
    /// up from there.
    pub fn release_queued(&self, peer: &PeerId, change_id: &str) -> bool {
        self.with_record(peer, change_id, |r| {
            if r.state == DeliveryState::Queued {
                r.state = DeliveryState::Pending;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Claim a queued record for one send attempt. False if it is terminal, already in
    /// flight, or waiting out a retry interval.
    pub fn begin_attempt(&self, peer: &PeerId, change_id: &str) -> bool {
        let now = Utc::now();
        self.with_record(peer, change_id, |r| {
            let ready = match &r.state {
                DeliveryState::Pending | DeliveryState::Queued => true,
                DeliveryState::RetryScheduled { not_before } => *not_before <= now,
                DeliveryState::InFlight | DeliveryState::Sent | DeliveryState::Failed => false,
            };
            if ready {
                r.state = DeliveryState::InFlight;
                r.last_attempt_at = Some(now);
            }
            ready
        })
        .unwrap_or(false)
    }

    /// Claim every record for `peer` that is pending outside the queue or whose retry is
    /// due, oldest first.
    pub fn take_due(&self, peer: &PeerId, now: DateTime<Utc>) -> Vec<Arc<ChangeRecord>> {
        let mut inner = self.inner.lock();
        let mut due: Vec<&mut DeliveryRecord> = inner
            .records
            .values_mut()
            .filter(|r| &r.peer == peer)
            .filter(|r| match &r.state {
                DeliveryState::Pending => true,
                DeliveryState::RetryScheduled { not_before } => *not_before <= now,
                _ => false,
            })
            .collect();
        due.sort_by_key(|r| r.seq);
        due.into_iter()
            .map(|r| {
                r.state = DeliveryState::InFlight;
                r.last_attempt_at = Some(now);
                r.record.clone()
            })
            .collect()
    }

    pub fn mark_sent(&self, peer: &PeerId, change_id: &str) {
        self.with_record(peer, change_id, |r| {
            r.state = DeliveryState::Sent;
            r.sent_at = Some(Utc::now());
            r.last_error = None;
        });
    }

    /// Count one failed attempt. Returns the resulting state.
    pub fn record_failure(&self, peer: &PeerId, change_id: &str, error: &str) -> DeliveryState {
        let max_retries = self.max_retries;
        let retry_interval = self.retry_interval;
        self.with_record(peer, change_id, |r| {
            if r.state.is_terminal() {
                return r.state.clone();
            }
            r.attempts += 1;
            r.last_error = Some(truncate_error(error));
            r.state = if r.attempts >= max_retries {
                DeliveryState::Failed
            } else {
                DeliveryState::RetryScheduled {
                    not_before: Utc::now() + retry_interval,
                }
            };
            r.state.clone()
        })
        .unwrap_or(DeliveryState::Failed)
    }

    /// Fail without counting an attempt (the change can never be sent, e.g. oversize).
    pub fn fail_permanently(&self, peer: &PeerId, change_id: &str, error: &str) {
        self.with_record(peer, change_id, |r| {
            r.state = DeliveryState::Failed;
            r.last_error = Some(truncate_error(error));
        });
    }

    /// Hand an in-flight record back to the sweep without counting an attempt. Used when
    /// the transport has nowhere to send yet.
    pub fn defer(&self, peer: &PeerId, change_id: &str) -> bool {
        self.with_record(peer, change_id, |r| {
            if r.state == DeliveryState::InFlight {
                r.state = DeliveryState::Pending;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Return interrupted attempts to `Pending` when a session ends mid-send.
    pub fn release_in_flight(&self, peer: &PeerId) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for r in inner.records.values_mut() {
            if &r.peer == peer && r.state == DeliveryState::InFlight {
                r.state = DeliveryState::Pending;
                released += 1;
            }
        }
        released
    }

    pub fn get(&self, peer: &PeerId, change_id: &str) -> Option<DeliveryRecord> {
        self.inner
            .lock()
            .records
            .get(&(peer.clone(), change_id.to_string()))
            .cloned()
    }

    pub fn counts(&self, peer: &PeerId) -> DeliveryCounts {
        let inner = self.inner.lock();
        let mut counts = DeliveryCounts::default();
        for r in inner.records.values().filter(|r| &r.peer == peer) {
            match r.state {
                DeliveryState::Sent => counts.sent += 1,
                DeliveryState::Failed => counts.failed += 1,
                _ => counts.pending += 1,
            }
        }
        counts
    }

    pub fn totals(&self) -> DeliveryCounts {
        let inner = self.inner.lock();
        let mut counts = DeliveryCounts::default();
        for r in inner.records.values() {
            match r.state {
                DeliveryState::Sent => counts.sent += 1,
                DeliveryState::Failed => counts.failed += 1,
                _ => counts.pending += 1,
            }
        }
        counts
    }

    /// Drop every record for a peer whose definition was deleted
    pub fn remove_peer(&self, peer: &PeerId) {
        self.inner.lock().records.retain(|(p, _), _| p != peer);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Work handed to a peer's send duty
#[derive(Clone, Debug)]
pub enum QueuedItem {
    Change(Arc<ChangeRecord>),
    /// Pre-encoded tactical event relayed as-is
    Cot(Bytes),
}

/// Bounded FIFO between the federation service and one peer's send duty. The receiving end
/// outlives individual sessions so queued work survives a reconnect.
#[derive(Clone)]
pub struct PeerQueue {
    tx: mpsc::Sender<QueuedItem>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedItem>>>,
}

impl PeerQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Blocking hand-off bounded by `timeout`. False if the queue stayed full.
    pub async fn offer(&self, item: QueuedItem, timeout: Duration) -> bool {
        self.tx.send_timeout(item, timeout).await.is_ok()
    }

    pub fn try_offer(&self, item: QueuedItem) -> bool {
        self.tx.try_send(item).is_ok()
    }

    pub fn receiver(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedItem>>> {
        self.rx.clone()
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, MissionChange};

    fn change(id: &str) -> Arc<ChangeRecord> {
        Arc::new(ChangeRecord::local(MissionChange {
            change_id: id.to_string(),
            mission_name: "Training-Alpha".to_string(),
            kind: ChangeKind::AddContent,
            creator_uid: "u".to_string(),
            timestamp: Utc::now(),
            payload: String::new(),
        }))
    }

    #[test]
    fn test_create_is_idempotent() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        assert!(ledger.create(&peer, change("c1")));
        assert!(ledger.begin_attempt(&peer, "c1"));
        ledger.mark_sent(&peer, "c1");

        assert!(!ledger.create(&peer, change("c1")));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.counts(&peer).sent, 1);
        assert_eq!(ledger.counts(&peer).pending, 0);
        assert!(ledger.take_due(&peer, Utc::now()).is_empty());
    }

    #[test]
    fn test_same_change_tracked_per_peer() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let record = change("c1");
        assert!(ledger.create(&PeerId::new("a"), record.clone()));
        assert!(ledger.create(&PeerId::new("b"), record));
        assert_eq!(ledger.totals().pending, 2);
    }

    #[test]
    fn test_single_attempt_in_flight() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        ledger.create(&peer, change("c1"));
        assert!(ledger.mark_queued(&peer, "c1"));
        assert!(ledger.begin_attempt(&peer, "c1"));
        assert!(!ledger.begin_attempt(&peer, "c1"));
        assert!(ledger.take_due(&peer, Utc::now()).is_empty());
    }

    #[test]
    fn test_timed_out_hand_off_returns_to_sweep() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        ledger.create(&peer, change("c1"));
        assert!(ledger.mark_queued(&peer, "c1"));
        assert!(ledger.take_due(&peer, Utc::now()).is_empty());

        assert!(ledger.release_queued(&peer, "c1"));
        assert!(!ledger.release_queued(&peer, "c1"));
        assert_eq!(ledger.take_due(&peer, Utc::now()).len(), 1);
    }

    #[test]
    fn test_retry_cap_reaches_failed() {
        let ledger = DeliveryLedger::new(3, Duration::from_millis(0));
        let peer = PeerId::new("alpha");
        ledger.create(&peer, change("c1"));

        for attempt in 1..=3u32 {
            let due = ledger.take_due(&peer, Utc::now() + chrono::Duration::seconds(1));
            assert_eq!(due.len(), 1, "attempt {}", attempt);
            let state = ledger.record_failure(&peer, "c1", "connection reset");
            if attempt < 3 {
                assert!(matches!(state, DeliveryState::RetryScheduled { .. }));
            } else {
                assert_eq!(state, DeliveryState::Failed);
            }
        }

        let record = ledger.get(&peer, "c1").unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error.as_deref(), Some("connection reset"));
        assert!(ledger
            .take_due(&peer, Utc::now() + chrono::Duration::hours(1))
            .is_empty());
        assert!(!ledger.begin_attempt(&peer, "c1"));
    }

    #[test]
    fn test_retry_waits_for_interval() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        ledger.create(&peer, change("c1"));
        ledger.take_due(&peer, Utc::now());
        ledger.record_failure(&peer, "c1", "timeout");

        assert!(ledger.take_due(&peer, Utc::now()).is_empty());
        assert_eq!(
            ledger
                .take_due(&peer, Utc::now() + chrono::Duration::seconds(61))
                .len(),
            1
        );
    }

    #[test]
    fn test_take_due_is_oldest_first() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        for id in ["c1", "c2", "c3"] {
            ledger.create(&peer, change(id));
        }
        let ids: Vec<String> = ledger
            .take_due(&peer, Utc::now())
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_release_in_flight_and_long_errors() {
        let ledger = DeliveryLedger::new(5, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        ledger.create(&peer, change("c1"));
        ledger.take_due(&peer, Utc::now());
        assert_eq!(ledger.release_in_flight(&peer), 1);
        assert_eq!(ledger.get(&peer, "c1").unwrap().state, DeliveryState::Pending);

        ledger.fail_permanently(&peer, "c1", &"x".repeat(5000));
        let record = ledger.get(&peer, "c1").unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.last_error.unwrap().len(), 1000);
    }

    #[test]
    fn test_deferred_attempts_are_not_counted() {
        let ledger = DeliveryLedger::new(2, Duration::from_secs(60));
        let peer = PeerId::new("alpha");
        ledger.create(&peer, change("c1"));

        for _ in 0..5 {
            assert_eq!(ledger.take_due(&peer, Utc::now()).len(), 1);
            assert!(ledger.defer(&peer, "c1"));
        }
        let record = ledger.get(&peer, "c1").unwrap();
        assert_eq!(record.state, DeliveryState::Pending);
        assert_eq!(record.attempts, 0);

        // only in-flight records can be deferred
        assert!(!ledger.defer(&peer, "c1"));
        ledger.mark_sent(&peer, "c1");
        assert!(!ledger.defer(&peer, "c1"));
        assert_eq!(ledger.get(&peer, "c1").unwrap().state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn test_queue_applies_backpressure() {
        let queue = PeerQueue::new(1);
        assert!(queue.offer(QueuedItem::Cot(Bytes::from_static(b"a")), Duration::from_millis(10)).await);
        assert!(!queue.offer(QueuedItem::Cot(Bytes::from_static(b"b")), Duration::from_millis(10)).await);
        assert_eq!(queue.depth(), 1);

        let rx = queue.receiver();
        let item = rx.lock().await.recv().await;
        assert!(matches!(item, Some(QueuedItem::Cot(_))));
        assert!(queue.try_offer(QueuedItem::Cot(Bytes::from_static(b"c"))));
    }
}
