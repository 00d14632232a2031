//! Outbound dialer: opens the transport a peer definition asks for and hands it to a new
//! peer connection.

use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer_connection::{PeerConnection, SessionContext, SessionInfo};
use super::tls::{self, CredentialMaterial, SecureStream, TlsError};
use super::transport::{DatagramTransport, FederationTransport, StreamTransport};
use crate::types::{ConnectionStatus, Direction, PeerDefinition, TransportKind};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("Credentials for {peer} unusable: {source}")]
    Credentials {
        peer: String,
        #[source]
        source: TlsError,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: TlsError,
    },

    #[error("Failed to open datagram socket for {addr}: {source}")]
    Datagram {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Peer {0} is an inbound stream peer and cannot be dialed")]
    NotDialable(String),
}

/// Socket limits shared by every dial
#[derive(Clone, Debug)]
pub struct DialerSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub read_timeout: Duration,
    pub safe_datagram_size: usize,
    pub max_datagram_size: usize,
    /// Local address inbound datagram peers bind on
    pub bind_address: String,
}

/// Result of a one-shot connectivity check
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionTestReport {
    pub peer: String,
    pub success: bool,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

pub struct OutboundDialer {
    settings: DialerSettings,
}

impl OutboundDialer {
    pub fn new(settings: DialerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DialerSettings {
        &self.settings
    }

    /// Open the transport for `def` and start a session on it.
    pub async fn dial(
        &self,
        def: &PeerDefinition,
        ctx: SessionContext,
        parent: &CancellationToken,
    ) -> Result<Arc<PeerConnection>, ConnectError> {
        if !def.is_dialable() {
            return Err(ConnectError::NotDialable(def.name.clone()));
        }

        let (transport, remote_addr) = match def.transport {
            TransportKind::Stream => self.open_stream(def).await?,
            TransportKind::Datagram => self.open_datagram(def).await?,
        };

        let info = SessionInfo::new(
            def.id(),
            def.direction,
            def.transport,
            def.protocol_variant,
            remote_addr,
            transport.is_encrypted(),
        );
        Ok(PeerConnection::start(info, transport, ctx, parent))
    }

    async fn open_stream(
        &self,
        def: &PeerDefinition,
    ) -> Result<(Arc<dyn FederationTransport>, String), ConnectError> {
        let addr = def.socket_addr_string();
        info!("🔗 [OUTBOUND] Connecting to {} ({})", def.name, addr);

        let stream = match tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::Connect { addr, source: e }),
            Err(_) => {
                return Err(ConnectError::Timeout {
                    addr,
                    timeout: self.settings.connect_timeout,
                })
            }
        };
        configure_stream(&stream, &def.name);

        let secure = if def.require_encryption {
            // Material lives only for the handshake and is scrubbed when it drops.
            let config = {
                let material = CredentialMaterial::from_definition(def);
                tls::build_client_config(&material, def.verify_peer).map_err(|e| {
                    ConnectError::Credentials {
                        peer: def.name.clone(),
                        source: e,
                    }
                })?
            };
            if !def.verify_peer {
                warn!(
                    "⚠️ [OUTBOUND] Peer verification disabled for {}; accepting any server certificate",
                    def.name
                );
            }

            let handshake = tls::connect_client(config, stream, &def.address);
            let tls_stream = match tokio::time::timeout(self.settings.connect_timeout, handshake)
                .await
            {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ConnectError::Handshake { addr, source: e }),
                Err(_) => {
                    return Err(ConnectError::Timeout {
                        addr,
                        timeout: self.settings.connect_timeout,
                    })
                }
            };
            debug!("🔒 [OUTBOUND] TLS established with {}", def.name);
            SecureStream::ClientTls(Box::new(tls_stream))
        } else {
            SecureStream::Plain(stream)
        };

        let transport = StreamTransport::new(
            secure,
            self.settings.io_timeout,
            self.settings.read_timeout,
        );
        Ok((Arc::new(transport), addr))
    }

    async fn open_datagram(
        &self,
        def: &PeerDefinition,
    ) -> Result<(Arc<dyn FederationTransport>, String), ConnectError> {
        if def.require_encryption {
            warn!(
                "⚠️ [{}] Encryption requested for datagram peer {}; datagram transport is plaintext only",
                def.direction, def.name
            );
        }

        let addr = def.socket_addr_string();
        let datagram_err = |source: io::Error| ConnectError::Datagram {
            addr: addr.clone(),
            source,
        };

        let transport = match def.direction {
            Direction::Outbound => {
                let local = if def.address.contains(':') {
                    "[::]:0"
                } else {
                    "0.0.0.0:0"
                };
                let socket = UdpSocket::bind(local).await.map_err(datagram_err)?;
                socket.connect(&addr).await.map_err(datagram_err)?;
                info!("📡 [OUTBOUND] Datagram endpoint for {} -> {}", def.name, addr);
                DatagramTransport::connected(
                    socket,
                    self.settings.safe_datagram_size,
                    self.settings.max_datagram_size,
                )
            }
            Direction::Inbound => {
                let bind = format!("{}:{}", self.settings.bind_address, def.port);
                let socket = UdpSocket::bind(&bind).await.map_err(datagram_err)?;
                info!("📡 [INBOUND] Datagram endpoint for {} bound on {}", def.name, bind);
                DatagramTransport::bound(
                    socket,
                    self.settings.safe_datagram_size,
                    self.settings.max_datagram_size,
                )
            }
        };
        Ok((Arc::new(transport), addr))
    }

    /// Dial with a throwaway context, wait briefly for the session to prove itself, then
    /// disconnect.
    pub async fn test_connection(
        &self,
        def: &PeerDefinition,
        node_id: &str,
        wait: Duration,
        heartbeat_interval: Duration,
    ) -> ConnectionTestReport {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let ctx = SessionContext::detached(node_id, heartbeat_interval);

        let error = match self.dial(def, ctx, &cancel).await {
            Ok(conn) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = conn.closed() => {}
                }
                let error = match conn.state() {
                    state if state.status() == ConnectionStatus::Connected => None,
                    super::connection_state::SessionState::Error { reason, .. } => Some(reason),
                    _ => Some("connection closed by peer".to_string()),
                };
                conn.stop_and_wait().await;
                error
            }
            Err(e) => Some(e.to_string()),
        };

        let report = ConnectionTestReport {
            peer: def.name.clone(),
            success: error.is_none(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            error,
        };
        if report.success {
            info!("✅ Connection test to {} succeeded in {}ms", def.name, report.elapsed_ms);
        } else {
            warn!(
                "❌ Connection test to {} failed: {}",
                def.name,
                report.error.as_deref().unwrap_or("unknown")
            );
        }
        report
    }
}

/// Keepalive and nodelay on federation sockets
pub(crate) fn configure_stream(stream: &TcpStream, label: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP_KEEPALIVE: {}", e);
    } else {
        debug!("✓ TCP keepalive enabled for {}", label);
    }
}
