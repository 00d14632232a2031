//! End-to-end federation between in-process nodes over localhost.
//!
//! Success criteria:
//! - Mutually authenticated sessions carry mission changes both ways
//! - Federated changes are never forwarded again
//! - Untrusted client certificates are rejected without disturbing live sessions
//! - Failed sessions are retried no faster than the retry interval
//! - Datagram size limits are enforced per change

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use bytes::Bytes;
    use federd::delivery::DeliveryState;
    use federd::network::wire::{self, Envelope};
    use federd::store::FanoutEvent;
    use federd::types::{ConnectionStatus, Direction, ProtocolVariant, TransportKind};
    use federd::{ChangeRecord, PeerId};
    use std::time::{Duration, Instant};
    use tokio::net::{TcpListener, TcpStream};

    const WAIT: Duration = Duration::from_secs(10);

    /// Hub with mTLS listeners and one inbound definition for `spoke-node`
    async fn start_hub(pki: &Pki) -> (Node, tempfile::TempDir, u16) {
        let (dir, credentials) = pki.listener_files("hub-node");
        let mut settings = fast_settings("hub-node");
        settings.listener_credentials = Some(credentials);

        let mut spoke = peer("spoke", Direction::Inbound, TransportKind::Stream, 0);
        spoke.node_id = Some("spoke-node".to_string());
        spoke.require_encryption = true;
        spoke.sync_cot = true;

        let hub = Node::new(settings, vec![spoke]);
        hub.service.start().await.unwrap();
        let port = hub
            .service
            .listener_addr(ProtocolVariant::Current)
            .unwrap()
            .port();

        // inbound identities are matched against definitions loaded by reconciliation
        assert!(wait_for(WAIT, || hub.service.health().peer("spoke").is_some()).await);
        (hub, dir, port)
    }

    async fn start_spoke(pki: &Pki, hub_port: u16) -> Node {
        let identity = pki.identity("spoke-node");
        let mut hub = mtls_peer("hub", hub_port, pki, &identity);
        hub.sync_cot = true;

        let spoke = Node::new(fast_settings("spoke-node"), vec![hub]);
        spoke.service.start().await.unwrap();
        spoke
    }

    fn state_of(node: &Node, peer: &str) -> Option<ConnectionStatus> {
        node.service.health().peer(peer).map(|p| p.state)
    }

    #[tokio::test]
    async fn test_mutual_tls_federation_both_directions() {
        let pki = Pki::new("Exercise Federation CA");
        let (hub, _dir, port) = start_hub(&pki).await;
        let spoke = start_spoke(&pki, port).await;

        assert!(
            wait_for(WAIT, || {
                state_of(&hub, "spoke") == Some(ConnectionStatus::Connected)
                    && state_of(&spoke, "hub") == Some(ConnectionStatus::Connected)
            })
            .await,
            "sessions never came up"
        );
        let spoke_view = hub.service.health();
        assert_eq!(spoke_view.peer("spoke").unwrap().encrypted, Some(true));

        // spoke -> hub
        let mut hub_events = hub.fanout.subscribe();
        let routed = spoke
            .service
            .on_local_change(ChangeRecord::local(change("c-1", "ops-alpha", "first")))
            .await;
        assert_eq!(routed, 1);

        assert!(
            wait_for_mission(&hub.missions, "ops-alpha", WAIT, |m| m.changes.len() == 1).await
        );
        assert!(
            wait_for(WAIT, || {
                spoke
                    .service
                    .delivery_record("hub", "c-1")
                    .is_some_and(|r| r.state == DeliveryState::Sent)
            })
            .await
        );

        let mission = hub.missions.mission("ops-alpha").await.unwrap();
        assert!(mission.created_by_federation);
        let applied = mission.changes[0].clone();
        assert!(applied.origin_is_federated);
        assert_eq!(applied.change.payload, "first");

        match tokio::time::timeout(WAIT, hub_events.recv()).await.unwrap().unwrap() {
            FanoutEvent::Change(record) => assert_eq!(record.id(), "c-1"),
            other => panic!("unexpected fan-out event: {:?}", other),
        }

        // a change that arrived through federation is never sent back out
        assert_eq!(hub.service.on_local_change(applied).await, 0);
        assert!(hub.service.delivery_record("spoke", "c-1").is_none());

        // hub -> spoke
        let routed = hub
            .service
            .on_local_change(ChangeRecord::local(change("c-2", "ops-alpha", "second")))
            .await;
        assert_eq!(routed, 1);
        assert!(
            wait_for_mission(&spoke.missions, "ops-alpha", WAIT, |m| {
                m.changes.iter().any(|c| c.id() == "c-2")
            })
            .await
        );
        assert!(
            wait_for(WAIT, || {
                hub.service
                    .delivery_record("spoke", "c-2")
                    .is_some_and(|r| r.state == DeliveryState::Sent)
            })
            .await
        );

        // tactical event relay
        let mut spoke_events = spoke.fanout.subscribe();
        let event = wire::encode(&Envelope::Other {
            uid: "ANDROID-42".to_string(),
            cot_type: "a-f-G-U-C".to_string(),
        });
        assert_eq!(hub.service.on_local_cot(Bytes::from(event)), 1);

        let relayed = tokio::time::timeout(WAIT, async {
            loop {
                match spoke_events.recv().await {
                    Ok(FanoutEvent::Cot { from, raw }) => return (from, raw),
                    Ok(_) => continue,
                    Err(e) => panic!("fan-out closed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(relayed.0, PeerId::new("hub"));
        assert!(String::from_utf8_lossy(&relayed.1).contains("ANDROID-42"));

        let history = spoke.peers.history("hub");
        assert!(history.iter().any(|s| s.state == ConnectionStatus::Connected));

        hub.service.shutdown().await;
        spoke.service.shutdown().await;

        assert_eq!(hub.service.health().connected_peers, 0);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_untrusted_client_certificate_is_rejected() {
        let pki = Pki::new("Exercise Federation CA");
        let (hub, _dir, port) = start_hub(&pki).await;
        let spoke = start_spoke(&pki, port).await;
        assert!(
            wait_for(WAIT, || state_of(&hub, "spoke") == Some(ConnectionStatus::Connected)).await
        );

        // trusts the hub, but presents a certificate from a CA the hub does not know
        let rogue_pki = Pki::new("Rogue CA");
        let rogue_identity = rogue_pki.identity("spoke-node");
        let mut def = peer("hub", Direction::Outbound, TransportKind::Stream, port);
        def.require_encryption = true;
        def.ca_certificate = Some(pki.ca_pem());
        def.local_certificate = Some(rogue_identity.cert_pem.clone());
        def.local_private_key = Some(rogue_identity.key_pem.clone());

        let rogue = Node::new(fast_settings("rogue"), Vec::new());
        let report = rogue.service.test_connection(&def).await;
        assert!(!report.success);

        assert!(wait_for(WAIT, || hub.service.health().rejected_handshakes >= 1).await);
        let health = hub.service.health();
        assert_eq!(health.connected_peers, 1);
        assert_eq!(health.peer("spoke").unwrap().state, ConnectionStatus::Connected);
        assert!(health.peers.iter().all(|p| !p.ad_hoc));

        hub.service.shutdown().await;
        spoke.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_identity_is_tracked_ad_hoc() {
        let pki = Pki::new("Exercise Federation CA");
        let (hub, _dir, port) = start_hub(&pki).await;

        let identity = pki.identity("stranger-node");
        let stranger = Node::new(
            fast_settings("stranger-node"),
            vec![mtls_peer("hub", port, &pki, &identity)],
        );
        stranger.service.start().await.unwrap();

        assert!(
            wait_for(WAIT, || {
                state_of(&hub, "inbound:stranger-node") == Some(ConnectionStatus::Connected)
            })
            .await
        );

        let health = hub.service.health();
        let ad_hoc = health.peer("inbound:stranger-node").unwrap();
        assert!(ad_hoc.ad_hoc);
        assert_eq!(ad_hoc.node_id.as_deref(), Some("stranger-node"));
        // configured peers only
        assert_eq!(health.total_peers, 1);

        // ad-hoc peers receive nothing and never reach the configuration store
        assert_eq!(
            hub.service
                .on_local_change(ChangeRecord::local(change("c-9", "ops", "x")))
                .await,
            1
        );
        assert!(hub
            .service
            .delivery_record("inbound:stranger-node", "c-9")
            .is_none());
        assert!(hub.peers.history("inbound:stranger-node").is_empty());

        hub.service.shutdown().await;
        stranger.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_sessions_back_off_before_redial() {
        // accepts and holds every connection without ever writing
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, mut accepted_rx) = tokio::sync::mpsc::unbounded_channel();
        let acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
                let _ = accepted_tx.send(Instant::now());
            }
        });

        let mut settings = fast_settings("dialer");
        settings.dialer.read_timeout = Duration::from_millis(150);
        settings.retry_interval = Duration::from_millis(400);
        let node = Node::new(
            settings,
            vec![peer("silent", Direction::Outbound, TransportKind::Stream, port)],
        );
        node.service.start().await.unwrap();

        let first = tokio::time::timeout(WAIT, accepted_rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(WAIT, accepted_rx.recv()).await.unwrap().unwrap();
        assert!(
            second.duration_since(first) >= Duration::from_millis(400),
            "redialed after {:?}",
            second.duration_since(first)
        );

        let history = node.peers.history("silent");
        assert!(history.iter().any(|s| s.state == ConnectionStatus::Connected));
        assert!(history
            .iter()
            .any(|s| s.state == ConnectionStatus::Error && s.last_error.is_some()));

        node.service.shutdown().await;
        acceptor.abort();
    }

    #[tokio::test]
    async fn test_refused_dials_respect_retry_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let node = Node::new(
            fast_settings("dialer"),
            vec![peer("offline", Direction::Outbound, TransportKind::Stream, port)],
        );
        node.service.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        let attempts = node.service.health().peer("offline").unwrap().dial_attempts;
        assert!((1..=3).contains(&attempts), "{} dial attempts", attempts);

        assert!(
            wait_for(WAIT, || {
                node.service
                    .health()
                    .peer("offline")
                    .is_some_and(|p| p.state == ConnectionStatus::Error && p.next_retry_at.is_some())
            })
            .await
        );
        let stored = node.peers.peers.status(&PeerId::new("offline")).await.unwrap();
        assert!(stored.last_error.is_some());

        node.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_datagram_federation_and_size_limits() {
        let port = free_udp_port();

        let receiver = Node::new(
            fast_settings("udp-hub"),
            vec![peer("udp-spoke", Direction::Inbound, TransportKind::Datagram, port)],
        );
        receiver.service.start().await.unwrap();
        assert!(
            wait_for(WAIT, || {
                state_of(&receiver, "udp-spoke") == Some(ConnectionStatus::Connected)
            })
            .await
        );

        let mut settings = fast_settings("udp-spoke");
        settings.dialer.safe_datagram_size = 512;
        settings.dialer.max_datagram_size = 4096;
        let sender = Node::new(
            settings,
            vec![peer("udp-hub", Direction::Outbound, TransportKind::Datagram, port)],
        );
        sender.service.start().await.unwrap();
        assert!(
            wait_for(WAIT, || {
                state_of(&sender, "udp-hub") == Some(ConnectionStatus::Connected)
            })
            .await
        );
        let health = sender.service.health();
        assert_eq!(health.peer("udp-hub").unwrap().encrypted, Some(false));

        let small = ChangeRecord::local(change("d-1", "ops-udp", "short"));
        let fragmenting = ChangeRecord::local(change("d-2", "ops-udp", &"f".repeat(1500)));
        let oversize = ChangeRecord::local(change("d-3", "ops-udp", &"o".repeat(8000)));
        for record in [small, fragmenting, oversize] {
            assert_eq!(sender.service.on_local_change(record).await, 1);
        }

        assert!(
            wait_for_mission(&receiver.missions, "ops-udp", WAIT, |m| m.changes.len() == 2).await
        );
        for id in ["d-1", "d-2"] {
            assert!(
                wait_for(WAIT, || {
                    sender
                        .service
                        .delivery_record("udp-hub", id)
                        .is_some_and(|r| r.state == DeliveryState::Sent)
                })
                .await,
                "{} never sent",
                id
            );
        }

        assert!(
            wait_for(WAIT, || {
                sender
                    .service
                    .delivery_record("udp-hub", "d-3")
                    .is_some_and(|r| r.state == DeliveryState::Failed)
            })
            .await
        );
        let failed = sender.service.delivery_record("udp-hub", "d-3").unwrap();
        assert_eq!(failed.attempts, 0);
        assert!(failed.last_error.unwrap().contains("too large"));

        // oversize payload never reached the wire
        let mission = receiver.missions.mission("ops-udp").await.unwrap();
        assert!(mission.changes.iter().all(|c| c.id() != "d-3"));

        sender.service.shutdown().await;
        receiver.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_test_reports_both_outcomes() {
        let pki = Pki::new("Exercise Federation CA");
        let (hub, _dir, port) = start_hub(&pki).await;
        let tester = Node::new(fast_settings("spoke-node"), Vec::new());

        let identity = pki.identity("spoke-node");
        let report = tester
            .service
            .test_connection(&mtls_peer("hub", port, &pki, &identity))
            .await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.peer, "hub");
        assert!(report.error.is_none());
        // never touches the tester's live sessions
        assert_eq!(tester.service.health().connected_peers, 0);

        hub.service.shutdown().await;
        assert!(wait_for_closed_port(port, WAIT).await);

        let report = tester
            .service
            .test_connection(&mtls_peer("hub", port, &pki, &identity))
            .await;
        assert!(!report.success);
        assert!(report.error.is_some());
    }
}
