//! Inbound listener: one per protocol variant. Accepts stream connections, requires a
//! valid client certificate, and hands authenticated sessions to an [`InboundHandler`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::configure_stream;
use super::tls::{self, SecureStream};
use crate::types::ProtocolVariant;

/// An authenticated inbound stream, ready to become a peer connection
pub struct AcceptedSession {
    /// Common name of the client certificate, when it has one
    pub common_name: Option<String>,
    pub remote_addr: SocketAddr,
    pub protocol_variant: ProtocolVariant,
    pub stream: SecureStream,
}

impl AcceptedSession {
    /// Peer identity: certificate common name, else the remote address
    pub fn identity(&self) -> String {
        self.common_name
            .clone()
            .unwrap_or_else(|| self.remote_addr.ip().to_string())
    }
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_accepted(&self, session: AcceptedSession);
}

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct InboundListener {
    variant: ProtocolVariant,
    bind_addr: String,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    handler: Arc<dyn InboundHandler>,
    rejected: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl InboundListener {
    pub fn new(
        variant: ProtocolVariant,
        bind_addr: String,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
        handler: Arc<dyn InboundHandler>,
        rejected: Arc<AtomicU64>,
    ) -> Self {
        Self {
            variant,
            bind_addr,
            acceptor,
            handshake_timeout,
            handler,
            rejected,
            running: Mutex::new(None),
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Bind and start accepting. Calling it on a running listener returns the bound address.
    pub async fn start(&self, parent: &CancellationToken) -> io::Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = parent.child_token();

        let task = tokio::spawn(accept_loop(
            listener,
            self.variant,
            self.acceptor.clone(),
            self.handshake_timeout,
            self.handler.clone(),
            self.rejected.clone(),
            cancel.clone(),
        ));

        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            // lost a start race; keep the first listener
            cancel.cancel();
            return Ok(existing.local_addr);
        }
        *running = Some(Running {
            cancel,
            local_addr,
            task,
        });

        info!(
            "🌐 [INBOUND] {} listener accepting on {}",
            self.variant, local_addr
        );
        Ok(local_addr)
    }

    /// Close the listening socket and abort in-flight handshakes. No-op when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!("{} listener task ended abnormally: {}", self.variant, e);
            }
            info!("🛑 [INBOUND] {} listener on {} stopped", self.variant, running.local_addr);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    variant: ProtocolVariant,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    handler: Arc<dyn InboundHandler>,
    rejected: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("🔌 [INBOUND] Connection from {} on {} listener", addr, variant);
                    handshakes.spawn(handshake(
                        stream,
                        addr,
                        variant,
                        acceptor.clone(),
                        handshake_timeout,
                        handler.clone(),
                        rejected.clone(),
                    ));
                }
                Err(e) => {
                    warn!("⚠️ [INBOUND] Accept failed on {} listener: {}", variant, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }

    drop(listener);
    handshakes.shutdown().await;
}

async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    variant: ProtocolVariant,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    handler: Arc<dyn InboundHandler>,
    rejected: Arc<AtomicU64>,
) {
    configure_stream(&stream, &addr.to_string());

    let tls_stream =
        match tokio::time::timeout(handshake_timeout, tls::accept_server(&acceptor, stream)).await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "🚫 [INBOUND] Handshake from {} rejected on {} listener: {}",
                    addr, variant, e
                );
                return;
            }
            Err(_) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "🚫 [INBOUND] Handshake from {} timed out after {:?} on {} listener",
                    addr, handshake_timeout, variant
                );
                return;
            }
        };

    let stream = SecureStream::ServerTls(Box::new(tls_stream));
    let common_name = stream
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(tls::certificate_common_name);

    let session = AcceptedSession {
        common_name,
        remote_addr: addr,
        protocol_variant: variant,
        stream,
    };
    info!(
        "🔐 [INBOUND] Authenticated {} from {} on {} listener",
        session.identity(),
        addr,
        variant
    );
    handler.on_accepted(session).await;
}
