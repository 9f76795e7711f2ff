//! Proxy tunnel tests: HTTP CONNECT and SOCKS5 in front of the mock server

mod common;

use common::{MockServer, ServerProfile};
use mysql_broker::config::Endpoint;
use mysql_broker::net::{Dialer, HttpConnectDialer, ProxySpec};
use mysql_broker::{ConnectionBroker, Error, ErrorClass};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// CONNECT proxy answering `statuses[n]` to the n-th request, then 200 and a real tunnel
struct ConnectProxy {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    closed_after_refusal: Arc<AtomicUsize>,
}

impl ConnectProxy {
    async fn start(statuses: Vec<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed_after_refusal = Arc::new(AtomicUsize::new(0));

        {
            let requests = requests.clone();
            let closed = closed_after_refusal.clone();
            tokio::spawn(async move {
                let mut n = 0;
                while let Ok((mut client, _)) = listener.accept().await {
                    let status = statuses.get(n).copied();
                    n += 1;
                    let requests = requests.clone();
                    let closed = closed.clone();
                    tokio::spawn(async move {
                        let head = read_head(&mut client).await;
                        requests.lock().unwrap().push(head.clone());

                        if let Some(status) = status {
                            let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", status);
                            client.write_all(response.as_bytes()).await.unwrap();
                            let mut buf = [0u8; 16];
                            let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;
                            if matches!(read, Ok(Ok(0))) {
                                closed.fetch_add(1, Ordering::SeqCst);
                            }
                            return;
                        }

                        let target = head
                            .split_whitespace()
                            .nth(1)
                            .unwrap()
                            .to_string();
                        let mut upstream = TcpStream::connect(target).await.unwrap();
                        client
                            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                            .await
                            .unwrap();
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                    });
                }
            });
        }

        Self {
            addr,
            requests,
            closed_after_refusal,
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_407_is_proxy_error_and_socket_closed() {
    let proxy = ConnectProxy::start(vec!["407 Proxy Authentication Required"]).await;
    let dialer = HttpConnectDialer::new(ProxySpec::parse(&format!("http://{}", proxy.addr)).unwrap());

    let err = dialer
        .dial(&Endpoint::parse("db.internal:3306").unwrap())
        .await
        .unwrap_err();

    match &err {
        Error::Proxy { status, message } => {
            assert_eq!(*status, Some(407));
            assert!(message.contains("407"));
        }
        other => panic!("expected proxy error, got {other:?}"),
    }
    assert!(!err.is_retryable());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.closed_after_refusal.load(Ordering::SeqCst), 1);
    assert!(proxy.requests()[0].starts_with("CONNECT db.internal:3306 HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_proxy_credentials_sent_as_basic_auth() {
    let proxy = ConnectProxy::start(vec!["403 Forbidden"]).await;
    let dialer = HttpConnectDialer::new(
        ProxySpec::parse(&format!("http://bob:s3cret@{}", proxy.addr)).unwrap(),
    );

    let _ = dialer.dial(&Endpoint::parse("db.internal:3306").unwrap()).await;

    assert!(proxy.requests()[0].contains("Proxy-Authorization: Basic Ym9iOnMzY3JldA==\r\n"));
}

#[tokio::test]
async fn test_broker_connects_through_http_tunnel() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let proxy = ConnectProxy::start(vec![]).await;
    let mut config = server.config();
    config.proxy = Some(format!("http://{}", proxy.addr));

    let record = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.version().to_string(), "8.0.36");
    assert_eq!(
        proxy.requests()[0],
        format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", server.endpoint())
    );
}

#[tokio::test]
async fn test_proxy_5xx_is_retried() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let proxy = ConnectProxy::start(vec!["503 Service Unavailable", "502 Bad Gateway"]).await;
    let mut config = server.config();
    config.proxy = Some(format!("http://{}", proxy.addr));

    ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(proxy.requests().len(), 3);
}

#[tokio::test]
async fn test_proxy_4xx_aborts_broker() {
    let proxy = ConnectProxy::start(vec!["407 Proxy Authentication Required"; 8]).await;
    let config = mysql_broker::Configuration::builder("db.internal:3306", "root")
        .proxy(format!("http://{}", proxy.addr))
        .build();

    let err = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Proxy);
    assert_eq!(proxy.requests().len(), 1);
}

/// SOCKS5 proxy without authentication bridging to the requested IPv4 target
///
/// The first `refuse_first` CONNECT requests are answered with reply 0x05.
async fn socks_proxy(refuse_first: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                client.read_exact(&mut methods).await.unwrap();
                assert!(methods.contains(&0x00));
                client.write_all(&[0x05, 0x00]).await.unwrap();

                let mut request = [0u8; 4];
                client.read_exact(&mut request).await.unwrap();
                assert_eq!(request[..2], [0x05, 0x01]);
                assert_eq!(request[3], 0x01);
                let mut ip = [0u8; 4];
                client.read_exact(&mut ip).await.unwrap();
                let port = client.read_u16().await.unwrap();

                if counter.fetch_add(1, Ordering::SeqCst) < refuse_first {
                    client
                        .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();
                    return;
                }
                let mut upstream = TcpStream::connect((std::net::Ipv4Addr::from(ip), port))
                    .await
                    .unwrap();
                client
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    (addr, connects)
}

#[tokio::test]
async fn test_broker_connects_through_socks5() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let (proxy, _) = socks_proxy(0).await;
    let mut config = server.config();
    config.proxy = Some(format!("socks5://{}", proxy));

    let record = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert!(record.dsn().contains(&server.endpoint()));
    assert_eq!(server.logins(), 1);
}

#[tokio::test]
async fn test_socks_refusal_is_retried() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let (proxy, connects) = socks_proxy(1).await;
    let mut config = server.config();
    config.proxy = Some(format!("socks5://{}", proxy));

    let record = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.version().to_string(), "8.0.36");
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(server.logins(), 1);
}
