// TLS connect paths against an inline rustls listener.
use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::time::Duration;
use tern_client::{ConnectOptions, Connection, State, TlsMode, TlsOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

fn install_provider() {
    rustls::crypto::ring::default_provider().install_default().ok();
}

/// Minimal TLS NATS endpoint: INFO on accept, PONG per PING, reads the rest.
async fn spawn_tls_server() -> Result<(std::net::SocketAddr, String, tokio::task::JoinHandle<()>)>
{
    let cert = generate_simple_self_signed(vec!["localhost".into()]).context("self-signed cert")?;
    let cert_pem = cert.cert.pem();
    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der());
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], PrivateKeyDer::Pkcs8(key_der))
        .context("server config")?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind")?;
    let addr = listener.local_addr().context("addr")?;
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(stream).await else {
                    return;
                };
                if stream
                    .write_all(b"INFO {\"server_id\":\"TLS1\",\"tls_required\":true,\"max_payload\":1048576}\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let mut pending = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(end) = pending.windows(2).position(|w| w == b"\r\n") {
                        let line: Vec<u8> = pending.drain(..end + 2).collect();
                        if line.starts_with(b"PING") && stream.write_all(b"PONG\r\n").await.is_err()
                        {
                            return;
                        }
                    }
                }
            });
        }
    });
    Ok((addr, cert_pem, task))
}

fn tls_options(addr: std::net::SocketAddr, tls: TlsOptions) -> ConnectOptions {
    let mut options = ConnectOptions::defaults(vec![format!("tls://localhost:{}", addr.port())
        .parse()
        .expect("addr")]);
    options.connect_timeout = Duration::from_secs(2);
    options.tls = tls;
    options
}

#[tokio::test]
async fn connects_with_a_trusted_ca_file() -> Result<()> {
    install_provider();
    let (addr, cert_pem, server) = spawn_tls_server().await?;
    let ca_path = std::env::temp_dir().join(format!("tern-tls-ca-{}.pem", std::process::id()));
    std::fs::write(&ca_path, cert_pem).context("write ca")?;

    let connection = Connection::new(tls_options(
        addr,
        TlsOptions {
            mode: TlsMode::Require,
            ca_file: Some(ca_path.clone()),
            ..TlsOptions::default()
        },
    ));
    connection.connect().await?;
    assert_eq!(connection.state(), State::Open);
    let info = connection.server_info().expect("info");
    assert_eq!(info.server_id, "TLS1");

    connection.dispose().await;
    server.abort();
    std::fs::remove_file(&ca_path).ok();
    Ok(())
}

#[tokio::test]
async fn insecure_skip_verify_accepts_a_self_signed_server() -> Result<()> {
    install_provider();
    let (addr, _cert_pem, server) = spawn_tls_server().await?;

    let connection = Connection::new(tls_options(
        addr,
        TlsOptions {
            mode: TlsMode::Implicit,
            insecure_skip_verify: true,
            ..TlsOptions::default()
        },
    ));
    connection.connect().await?;
    assert_eq!(connection.state(), State::Open);

    connection.dispose().await;
    server.abort();
    Ok(())
}

#[tokio::test]
async fn untrusted_server_is_rejected_without_skip_verify() -> Result<()> {
    install_provider();
    let (addr, _cert_pem, server) = spawn_tls_server().await?;

    let connection = Connection::new(tls_options(
        addr,
        TlsOptions {
            mode: TlsMode::Require,
            ..TlsOptions::default()
        },
    ));
    let err = connection.connect().await.expect_err("untrusted cert");
    assert!(matches!(err, tern_client::Error::Connect(_)));

    connection.dispose().await;
    server.abort();
    Ok(())
}
