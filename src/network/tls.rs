//! TLS for federation sessions: peer-scoped credential material, mutual-auth configs and
//! the stream wrapper shared by both directions.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::PeerDefinition;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("Client verifier error: {0}")]
    Verifier(String),
    #[error("Certificate generation failed: {0}")]
    Generate(String),
}

/// PEM text for one handshake. Scrubbed from memory when dropped, so callers build it right
/// before the handshake and let it fall out of scope on every exit path.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct CredentialMaterial {
    ca_pem: Option<String>,
    cert_pem: Option<String>,
    key_pem: Option<String>,
}

impl CredentialMaterial {
    pub fn new(ca_pem: Option<String>, cert_pem: Option<String>, key_pem: Option<String>) -> Self {
        Self {
            ca_pem,
            cert_pem,
            key_pem,
        }
    }

    pub fn from_definition(def: &PeerDefinition) -> Self {
        Self::new(
            def.ca_certificate.clone(),
            def.local_certificate.clone(),
            def.local_private_key.clone(),
        )
    }

    pub fn has_identity(&self) -> bool {
        self.cert_pem.is_some() && self.key_pem.is_some()
    }

    fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let pem = self
            .cert_pem
            .as_deref()
            .ok_or(TlsError::MissingCredential("local_certificate"))?;
        parse_certs(pem)
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        let pem = self
            .key_pem
            .as_deref()
            .ok_or(TlsError::MissingCredential("local_private_key"))?;
        rustls_pemfile::private_key(&mut pem.as_bytes())?.ok_or(TlsError::InvalidPrivateKey)
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let pem = self
            .ca_pem
            .as_deref()
            .ok_or(TlsError::MissingCredential("ca_certificate"))?;
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(pem)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        }
        Ok(roots)
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate("no PEM certificates found".to_string()));
    }
    Ok(certs)
}

/// Client config for an outbound dial. With `verify_peer` the server is validated against
/// the supplied CA; without it any server certificate is accepted (handshake signatures are
/// still checked).
pub fn build_client_config(
    material: &CredentialMaterial,
    verify_peer: bool,
) -> Result<Arc<ClientConfig>, TlsError> {
    let builder = if verify_peer {
        ClientConfig::builder().with_root_certificates(material.root_store()?)
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier::new()))
    };

    let config = if material.has_identity() {
        builder.with_client_auth_cert(material.cert_chain()?, material.private_key()?)?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Server config for an inbound listener. Client certificates are mandatory and must chain
/// to the configured CA.
pub fn build_server_config(material: &CredentialMaterial) -> Result<Arc<ServerConfig>, TlsError> {
    let roots = material.root_store()?;
    let inner = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;
    let verifier = Arc::new(AuditingClientVerifier { inner });

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.cert_chain()?, material.private_key()?)?;
    Ok(Arc::new(config))
}

/// Wrap a TCP stream with TLS as a client
pub async fn connect_client(
    config: Arc<ClientConfig>,
    stream: TcpStream,
    address: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TlsError> {
    let server_name = ServerName::try_from(address.to_string())
        .map_err(|_| TlsError::InvalidCertificate(format!("invalid server name {}", address)))?;
    Ok(TlsConnector::from(config).connect(server_name, stream).await?)
}

/// Wrap a TCP stream with TLS as a server
pub async fn accept_server(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, TlsError> {
    Ok(acceptor.accept(stream).await?)
}

/// Common name of a presented certificate, if it has a readable one.
pub fn certificate_common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string());
    cn
}

fn subject_and_issuer(cert: &CertificateDer<'_>) -> Option<(String, String)> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    Some((parsed.subject().to_string(), parsed.issuer().to_string()))
}

/// Certificate verifier used when a peer definition disables verification.
/// WARNING: This accepts ANY server certificate
#[derive(Debug)]
struct AcceptAnyCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCertVerifier {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Delegates to webpki and logs the subject/issuer of every rejected client certificate.
#[derive(Debug)]
struct AuditingClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for AuditingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)
            .map_err(|e| {
                let (subject, issuer) = subject_and_issuer(end_entity)
                    .unwrap_or_else(|| ("<unparseable>".to_string(), "<unparseable>".to_string()));
                warn!(
                    "🚫 [INBOUND] Client certificate rejected: {} (subject: {}, issuer: {})",
                    e, subject, issuer
                );
                e
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A federation byte stream, TLS-wrapped in either role or plain TCP
pub enum SecureStream {
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    Plain(TcpStream),
}

impl SecureStream {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SecureStream::Plain(_))
    }

    /// Certificate chain the remote side presented, if any
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            SecureStream::ClientTls(s) => s.get_ref().1.peer_certificates(),
            SecureStream::ServerTls(s) => s.get_ref().1.peer_certificates(),
            SecureStream::Plain(_) => None,
        }
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            SecureStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            SecureStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            SecureStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            SecureStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            SecureStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            SecureStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            SecureStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            SecureStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A locally generated certificate authority for standing up a federation without an
/// external PKI.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

/// A leaf certificate issued by [`CertificateAuthority`]
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

fn generate_err(e: rcgen::Error) -> TlsError {
    TlsError::Generate(e.to_string())
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self, TlsError> {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(generate_err)?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
        ];
        let key = rcgen::KeyPair::generate().map_err(generate_err)?;
        let cert = params.self_signed(&key).map_err(generate_err)?;
        Ok(Self { cert, key })
    }

    pub fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a certificate usable for both server and client auth. IP literals in `sans`
    /// become IP subject alternative names.
    pub fn issue(&self, common_name: &str, sans: &[String]) -> Result<IssuedCertificate, TlsError> {
        let mut params = rcgen::CertificateParams::new(sans.to_vec()).map_err(generate_err)?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = rcgen::KeyPair::generate().map_err(generate_err)?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(generate_err)?;
        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}
