//! MySQL-level TLS against an in-process server
//!
//! The server offers `CLIENT_SSL`, waits for the SSL request packet, then
//! upgrades with the certificates under `tests/fixtures/tls` (issued for
//! `localhost` and `127.0.0.1` by the bundled test CA).

mod common;

use common::{command_loop, greeting_with_caps, ok_packet, read_packet, write_packet, ServerProfile};
use mysql_broker::config::CustomTls;
use mysql_broker::protocol::constants::capabilities::CLIENT_SSL;
use mysql_broker::{Configuration, ConnectionBroker, ErrorClass};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const CA: &str = include_str!("fixtures/tls/ca.pem");
const SERVER_CERT: &str = include_str!("fixtures/tls/server.pem");
const SERVER_KEY: &str = include_str!("fixtures/tls/server-key.pem");
const CLIENT_CERT: &str = include_str!("fixtures/tls/client.pem");
const CLIENT_KEY: &str = include_str!("fixtures/tls/client-key.pem");

fn acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut SERVER_CERT.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut SERVER_KEY.as_bytes())
        .unwrap()
        .unwrap();
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

struct TlsServer {
    addr: SocketAddr,
    handshakes: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
}

async fn tls_server(version: &'static str) -> TlsServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::new(AtomicUsize::new(0));
    let acceptor = acceptor();

    {
        let handshakes = handshakes.clone();
        let accepted = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let handshakes = handshakes.clone();
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    write_packet(&mut stream, 0, &greeting_with_caps(version, CLIENT_SSL))
                        .await
                        .unwrap();
                    let (seq, ssl_request) = read_packet(&mut stream).await.unwrap();
                    assert_eq!(seq, 1);
                    assert_eq!(ssl_request.len(), 32);

                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    handshakes.fetch_add(1, Ordering::SeqCst);

                    let (seq, _) = read_packet(&mut tls).await.unwrap();
                    assert_eq!(seq, 2);
                    write_packet(&mut tls, 3, &ok_packet()).await.unwrap();

                    let profile = ServerProfile::mysql(version);
                    let queries = Mutex::new(Vec::new());
                    let _ = command_loop(&mut tls, &profile, &queries).await;
                });
            }
        });
    }

    TlsServer {
        addr,
        handshakes,
        accepted,
    }
}

fn config(addr: SocketAddr) -> Configuration {
    Configuration::builder(addr.to_string(), "root")
        .password("secret")
        .connect_retry_timeout(Duration::from_secs(5))
        .build()
}

#[tokio::test]
async fn test_custom_ca_bundle() {
    let server = tls_server("8.0.36").await;
    let mut config = config(server.addr);
    config.custom_tls = Some(CustomTls::new(CA).client_identity(CLIENT_CERT, CLIENT_KEY));

    let broker = ConnectionBroker::new();
    let record = broker
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.handshakes.load(Ordering::SeqCst), 1);
    assert!(record.dsn().contains("tls=custom"));
    assert!(broker.tls_registry().get("custom").await.is_some());
}

#[tokio::test]
async fn test_custom_bundle_under_named_key() {
    let server = tls_server("8.0.36").await;
    let mut config = config(server.addr);
    config.custom_tls = Some(CustomTls::new(CA).config_key("corp-ca"));

    let record = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert!(record.dsn().contains("tls=corp-ca"));
}

#[tokio::test]
async fn test_skip_verify_accepts_any_certificate() {
    let server = tls_server("5.7.44").await;
    let mut config = config(server.addr);
    config.tls = "skip-verify".into();

    let record = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.version().to_string(), "5.7.44");
}

#[tokio::test]
async fn test_untrusted_certificate_is_not_retried() {
    let server = tls_server("8.0.36").await;
    let mut config = config(server.addr);
    config.tls = "true".into();

    let err = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Config);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(server.handshakes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_tls_mode_fails_before_dial() {
    let server = tls_server("8.0.36").await;
    let mut config = config(server.addr);
    config.tls = "preferred".into();

    let err = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Config);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 0);
}
