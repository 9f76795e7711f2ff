//! Shared fixtures: an in-process MySQL server and instrumented dialers

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use mysql_broker::config::Endpoint;
use mysql_broker::connection::Transport;
use mysql_broker::net::{Dialer, DirectDialer};
use mysql_broker::protocol::constants::capabilities::*;
use mysql_broker::protocol::frame_packet;
use mysql_broker::{Configuration, Error, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const SCRAMBLE: &[u8; 20] = b"abcdefghijklmnopqrst";
const SERVER_CAPS: u32 = CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CLIENT_TRANSACTIONS
    | CLIENT_MULTI_RESULTS
    | CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG;

/// Route broker logs to the test harness; `RUST_LOG=mysql_broker=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the mock server reports about itself
#[derive(Debug, Clone)]
pub struct ServerProfile {
    pub version: String,
    pub datadir: String,
    pub deny_login: bool,
}

impl ServerProfile {
    pub fn mysql(version: &str) -> Self {
        Self {
            version: version.to_string(),
            datadir: "/var/lib/mysql/".to_string(),
            deny_login: false,
        }
    }

    pub fn datadir(mut self, datadir: &str) -> Self {
        self.datadir = datadir.to_string();
        self
    }

    pub fn denying_login(mut self) -> Self {
        self.deny_login = true;
        self
    }
}

/// Minimal MySQL server speaking native auth and the text protocol
pub struct MockServer {
    pub addr: SocketAddr,
    queries: Arc<Mutex<Vec<String>>>,
    logins: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(profile: ServerProfile) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let logins = Arc::new(AtomicUsize::new(0));

        let handle = {
            let queries = queries.clone();
            let logins = logins.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let profile = profile.clone();
                    let queries = queries.clone();
                    let logins = logins.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, profile, queries, logins).await;
                    });
                }
            })
        };

        Self {
            addr,
            queries,
            logins,
            handle,
        }
    }

    /// `host:port` of the listener
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Statements received so far, across all sessions
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Successful logins so far
    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Configuration pointing at this server with a short retry budget
    pub fn config(&self) -> Configuration {
        Configuration::builder(self.endpoint(), "root")
            .password("secret")
            .connect_retry_timeout(Duration::from_secs(5))
            .build()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    profile: ServerProfile,
    queries: Arc<Mutex<Vec<String>>>,
    logins: Arc<AtomicUsize>,
) -> io::Result<()> {
    write_packet(&mut stream, 0, &greeting(&profile.version)).await?;
    let _ = read_packet(&mut stream).await?;

    if profile.deny_login {
        let mut err = vec![0xFF, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied for user 'root'@'localhost'");
        write_packet(&mut stream, 2, &err).await?;
        return Ok(());
    }
    write_packet(&mut stream, 2, &ok_packet()).await?;
    logins.fetch_add(1, Ordering::SeqCst);

    command_loop(&mut stream, &profile, &queries).await
}

/// Answer pings, version/datadir probes and statements until COM_QUIT or EOF
pub async fn command_loop<S>(
    stream: &mut S,
    profile: &ServerProfile,
    queries: &Mutex<Vec<String>>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (_, payload) = match read_packet(stream).await {
            Ok(packet) => packet,
            Err(_) => return Ok(()),
        };
        match payload.first() {
            Some(0x01) => return Ok(()),
            Some(0x0E) => write_packet(stream, 1, &ok_packet()).await?,
            Some(0x03) => {
                let sql = String::from_utf8_lossy(&payload[1..]).to_string();
                queries.lock().unwrap().push(sql.clone());
                match sql.as_str() {
                    "SELECT @@GLOBAL.version" => {
                        write_single_value(stream, "@@GLOBAL.version", &profile.version).await?
                    }
                    "SELECT @@GLOBAL.datadir" => {
                        write_single_value(stream, "@@GLOBAL.datadir", &profile.datadir).await?
                    }
                    _ => write_packet(stream, 1, &ok_packet()).await?,
                }
            }
            _ => {
                let mut err = vec![0xFF, 0x17, 0x04, b'#'];
                err.extend_from_slice(b"08S01Unknown command");
                write_packet(stream, 1, &err).await?;
            }
        }
    }
}

fn greeting(version: &str) -> Vec<u8> {
    greeting_with_caps(version, 0)
}

/// Protocol 10 greeting offering native auth plus `extra_caps`
pub fn greeting_with_caps(version: &str, extra_caps: u32) -> Vec<u8> {
    let caps = SERVER_CAPS | extra_caps;
    let mut p = BytesMut::new();
    p.put_u8(10);
    p.put_slice(version.as_bytes());
    p.put_u8(0);
    p.put_u32_le(42);
    p.put_slice(&SCRAMBLE[..8]);
    p.put_u8(0);
    p.put_u16_le((caps & 0xFFFF) as u16);
    p.put_u8(45);
    p.put_u16_le(2);
    p.put_u16_le((caps >> 16) as u16);
    p.put_u8(21);
    p.put_bytes(0, 10);
    p.put_slice(&SCRAMBLE[8..]);
    p.put_u8(0);
    p.put_slice(b"mysql_native_password\0");
    p.to_vec()
}

pub fn ok_packet() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

async fn write_single_value<S>(stream: &mut S, column: &str, value: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_packet(stream, 1, &[0x01]).await?;

    let mut def = BytesMut::new();
    for part in ["def", "", "", "", column, ""] {
        def.put_u8(part.len() as u8);
        def.put_slice(part.as_bytes());
    }
    def.put_u8(0x0c);
    def.put_u16_le(45);
    def.put_u32_le(256);
    def.put_u8(0xFD);
    def.put_u16_le(0);
    def.put_u8(0);
    def.put_u16_le(0);
    write_packet(stream, 2, &def).await?;
    write_packet(stream, 3, &[0xFE, 0, 0, 2, 0]).await?;

    let mut row = vec![value.len() as u8];
    row.extend_from_slice(value.as_bytes());
    write_packet(stream, 4, &row).await?;
    write_packet(stream, 5, &[0xFE, 0, 0, 2, 0]).await
}

pub async fn write_packet<S>(stream: &mut S, seq: u8, payload: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    frame_packet(&mut out, seq, payload);
    stream.write_all(&out).await
}

pub async fn read_packet<S>(stream: &mut S) -> io::Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((header[3], payload))
}

/// Direct dialer that counts dials and refuses the first `fail_first`
#[derive(Debug, Default)]
pub struct CountingDialer {
    dials: AtomicUsize,
    fail_first: usize,
}

impl CountingDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            dials: AtomicUsize::new(0),
            fail_first,
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing_first(usize::MAX)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, target: &Endpoint) -> Result<Transport> {
        let n = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "server not accepting connections yet",
            )));
        }
        DirectDialer.dial(target).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}
