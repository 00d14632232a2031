//! Transport capability seam. Stream and datagram sessions expose the same small surface so
//! the peer connection never branches on transport kind; the "datagram has no heartbeat and
//! no encryption" rule lives entirely in [`DatagramTransport`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::tls::SecureStream;
use super::wire::{check_datagram_size, DatagramFit, WireError};
use crate::types::TransportKind;

const READ_CHUNK: usize = 8192;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Stream I/O error: {0}")]
    Stream(#[source] io::Error),
    #[error("Datagram I/O error: {0}")]
    Datagram(#[source] io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    TooLarge(WireError),
    #[error("No datagram sender seen yet; nowhere to reply")]
    NoRemote,
}

impl TransportError {
    /// Fatal errors end the session. Datagram errors are per-packet and never fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Stream(_) | TransportError::Timeout(_) | TransportError::Closed
        )
    }
}

/// One unit read from a transport.
#[derive(Debug)]
pub enum Received {
    /// Arbitrary slice of a byte stream; envelope boundaries are found by the decoder
    Chunk(Bytes),
    /// Exactly one datagram
    Datagram(Bytes),
    /// Remote side closed the stream
    Eof,
}

#[async_trait]
pub trait FederationTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn supports_heartbeat(&self) -> bool;

    fn is_encrypted(&self) -> bool;

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    async fn recv(&self) -> Result<Received, TransportError>;

    /// Close the underlying socket. Safe to call more than once.
    async fn shutdown(&self);
}

/// TCP session, optionally TLS-wrapped.
pub struct StreamTransport {
    reader: tokio::sync::Mutex<ReadHalf<SecureStream>>,
    writer: tokio::sync::Mutex<WriteHalf<SecureStream>>,
    encrypted: bool,
    io_timeout: Duration,
    read_timeout: Duration,
}

impl StreamTransport {
    /// `io_timeout` bounds each write; `read_timeout` bounds how long the remote may stay
    /// silent (heartbeats keep a healthy session under it).
    pub fn new(stream: SecureStream, io_timeout: Duration, read_timeout: Duration) -> Self {
        let encrypted = stream.is_encrypted();
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            encrypted,
            io_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl FederationTransport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn supports_heartbeat(&self) -> bool {
        true
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.io_timeout, write).await {
            Ok(result) => result.map_err(TransportError::Stream),
            Err(_) => Err(TransportError::Timeout(self.io_timeout)),
        }
    }

    async fn recv(&self) -> Result<Received, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match tokio::time::timeout(self.read_timeout, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => Ok(Received::Eof),
            Ok(Ok(_)) => Ok(Received::Chunk(buf.freeze())),
            Ok(Err(e)) => Err(TransportError::Stream(e)),
            Err(_) => Err(TransportError::Timeout(self.read_timeout)),
        }
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
            debug!("Stream shutdown error (ignored): {}", e);
        }
    }
}

/// UDP session. Outbound sessions use a connected socket; inbound sessions are bound on the
/// definition's port, accept datagrams from any sender, and reply to the most recent one.
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    connected: bool,
    last_sender: Mutex<Option<SocketAddr>>,
    safe_size: usize,
    max_size: usize,
}

impl DatagramTransport {
    pub fn connected(socket: UdpSocket, safe_size: usize, max_size: usize) -> Self {
        Self {
            socket: Arc::new(socket),
            connected: true,
            last_sender: Mutex::new(None),
            safe_size,
            max_size,
        }
    }

    pub fn bound(socket: UdpSocket, safe_size: usize, max_size: usize) -> Self {
        Self {
            socket: Arc::new(socket),
            connected: false,
            last_sender: Mutex::new(None),
            safe_size,
            max_size,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl FederationTransport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn supports_heartbeat(&self) -> bool {
        false
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let fit = check_datagram_size(frame.len(), self.safe_size, self.max_size)
            .map_err(TransportError::TooLarge)?;
        if fit == DatagramFit::FragmentationRisk {
            warn!(
                "⚠️ Datagram of {} bytes exceeds safe size {} and may fragment",
                frame.len(),
                self.safe_size
            );
        }

        if self.connected {
            self.socket
                .send(frame)
                .await
                .map_err(TransportError::Datagram)?;
        } else {
            let target = (*self.last_sender.lock()).ok_or(TransportError::NoRemote)?;
            self.socket
                .send_to(frame, target)
                .await
                .map_err(TransportError::Datagram)?;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Received, TransportError> {
        let mut buf = vec![0u8; self.max_size.max(READ_CHUNK)];
        if self.connected {
            let n = self
                .socket
                .recv(&mut buf)
                .await
                .map_err(TransportError::Datagram)?;
            buf.truncate(n);
        } else {
            let (n, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(TransportError::Datagram)?;
            buf.truncate(n);
            *self.last_sender.lock() = Some(from);
        }
        Ok(Received::Datagram(Bytes::from(buf)))
    }

    async fn shutdown(&self) {
        // UDP has no close handshake; the socket is released when the last handle drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_stream_send_recv_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let a = StreamTransport::new(
            SecureStream::Plain(client),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let b = StreamTransport::new(
            SecureStream::Plain(server),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        assert!(a.supports_heartbeat());
        assert!(!a.is_encrypted());

        a.send(b"hello").await.unwrap();
        match b.recv().await.unwrap() {
            Received::Chunk(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("unexpected: {:?}", other),
        }

        a.shutdown().await;
        assert!(matches!(b.recv().await.unwrap(), Received::Eof));
    }

    #[tokio::test]
    async fn test_stream_read_timeout_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let _client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let t = StreamTransport::new(
            SecureStream::Plain(server),
            Duration::from_secs(5),
            Duration::from_millis(50),
        );
        let err = t.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_datagram_size_limits() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(receiver.local_addr().unwrap()).await.unwrap();
        let t = DatagramTransport::connected(sender, 16, 32);
        assert!(!t.supports_heartbeat());

        t.send(&[b'x'; 32]).await.unwrap();
        let err = t.send(&[b'x'; 33]).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::TooLarge(WireError::DatagramTooLarge { size: 33, max: 32 })
        ));
        assert!(!err.is_fatal());

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(n, 32);
    }

    #[tokio::test]
    async fn test_bound_datagram_replies_to_last_sender() {
        let bound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let t = DatagramTransport::bound(bound, 1400, 65507);
        assert!(matches!(
            t.send(b"early").await,
            Err(TransportError::NoRemote)
        ));

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        remote
            .send_to(b"ping", t.local_addr().unwrap())
            .await
            .unwrap();
        match t.recv().await.unwrap() {
            Received::Datagram(bytes) => assert_eq!(&bytes[..], b"ping"),
            other => panic!("unexpected: {:?}", other),
        }

        t.send(b"pong").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
