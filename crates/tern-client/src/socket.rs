//! Stream transport: plain TCP or TLS, plus the closed-signal the loops and
//! the reconnect supervisor coordinate through.
//!
//! # Design notes
//! TLS is decided before the I/O loops start: `Require`/`Implicit` negotiate
//! immediately after the TCP connect, `Auto`/`Prefer` follow the URL scheme,
//! `Disable` never upgrades. A mid-stream upgrade after INFO is not
//! performed.
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{ServerAddr, TlsMode, TlsOptions, TlsVersion};
use crate::error::{Error, Result};

/// A connected stream to one server.
#[derive(Debug)]
pub(crate) enum SocketStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl SocketStream {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, data),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial one endpoint within `timeout`, upgrading to TLS per the mode.
pub(crate) async fn connect(
    addr: &ServerAddr,
    tls: &TlsOptions,
    timeout: Duration,
) -> Result<SocketStream> {
    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((addr.host.as_str(), addr.port)),
    )
    .await
    .map_err(|_| Error::Connect(format!("connect to {addr} timed out")))?
    .map_err(|err| Error::Connect(format!("connect to {addr} failed: {err}")))?;
    let _ = stream.set_nodelay(true);

    let upgrade = match tls.mode {
        TlsMode::Disable => false,
        TlsMode::Require | TlsMode::Implicit => true,
        TlsMode::Auto | TlsMode::Prefer => addr.tls,
    };
    if !upgrade {
        return Ok(SocketStream::Tcp(stream));
    }

    let config = client_tls_config(tls)?;
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(addr.host.clone())
        .map_err(|_| Error::Connect(format!("invalid TLS server name: {}", addr.host)))?;
    let stream = tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| Error::Connect(format!("TLS handshake with {addr} timed out")))?
        .map_err(|err| Error::Connect(format!("TLS handshake with {addr} failed: {err}")))?;
    Ok(SocketStream::Tls(Box::new(stream)))
}

fn client_tls_config(tls: &TlsOptions) -> Result<rustls::ClientConfig> {
    let versions: Vec<&'static rustls::SupportedProtocolVersion> = tls
        .protocol_versions
        .iter()
        .map(|version| match version {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        })
        .collect();
    if versions.is_empty() {
        return Err(Error::Config("no TLS protocol versions enabled".to_string()));
    }
    let builder = rustls::ClientConfig::builder_with_protocol_versions(&versions);

    let mut roots = RootCertStore::empty();
    match &tls.ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|err| Error::Config(format!("invalid CA certificate: {err}")))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
    } else if let Some(crl_path) = &tls.crl_file {
        let crls = load_crls(crl_path)?;
        let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .with_crls(crls)
            .build()
            .map_err(|err| Error::Config(format!("build revocation verifier: {err}")))?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(verifier)
    } else {
        builder.with_root_certificates(roots)
    };

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)
            .map_err(|err| Error::Config(format!("invalid client certificate: {err}"))),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(Error::Config(
            "client cert and key must be configured together".to_string(),
        )),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| Error::Config(format!("parse certificates in {}: {err}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|err| Error::Config(format!("parse key in {}: {err}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path.display())))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;
    rustls_pemfile::crls(&mut pem.as_slice())
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| Error::Config(format!("parse CRLs in {}: {err}", path.display())))
}

/// Certificate verifier that accepts everything. Tests only.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// One-way "the socket is dead" flag shared by the loops, the ping watchdog,
/// and the reconnect supervisor. Trips once; every waiter observes it.
#[derive(Clone)]
pub(crate) struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn trip(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_tripped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal trips. Safe to race in `select!` loops.
    pub(crate) async fn tripped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone means the connection itself is gone.
                return;
            }
        }
    }
}
