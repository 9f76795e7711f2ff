//! HTTP CONNECT tunneling
//!
//! The proxy is reached over plain TCP for both `http://` and `https://` proxy
//! URLs. The response head is read one byte at a time: the MySQL server speaks
//! first, so any byte read past the blank line would belong to its greeting.

use super::{Dialer, ProxySpec};
use crate::config::Endpoint;
use crate::connection::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on the proxy response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Dialer that opens a tunnel with `CONNECT host:port`
#[derive(Debug, Clone)]
pub struct HttpConnectDialer {
    proxy: ProxySpec,
}

impl HttpConnectDialer {
    /// Create a dialer for the given proxy
    pub fn new(proxy: ProxySpec) -> Self {
        Self { proxy }
    }

    /// Proxy this dialer tunnels through
    pub fn proxy(&self) -> &ProxySpec {
        &self.proxy
    }

    fn connect_request(&self, target: &str) -> String {
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = self.proxy.basic_auth() {
            request.push_str("Proxy-Authorization: ");
            request.push_str(&auth);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request
    }
}

#[async_trait]
impl Dialer for HttpConnectDialer {
    async fn dial(&self, target: &Endpoint) -> Result<Transport> {
        let target = match target {
            Endpoint::Tcp { .. } => target.address(),
            other => {
                return Err(Error::Config(format!(
                    "{} cannot be reached through an HTTP proxy",
                    other
                )))
            }
        };

        tracing::debug!(proxy = %self.proxy, target = %target, "opening HTTP CONNECT tunnel");

        let mut stream = TcpStream::connect((self.proxy.host.as_str(), self.proxy.port)).await?;
        let _ = stream.set_nodelay(true);

        stream
            .write_all(self.connect_request(&target).as_bytes())
            .await?;
        stream.flush().await?;

        let head = read_response_head(&mut stream).await?;
        let (code, reason) = parse_status(&head)?;

        if code != 200 {
            let _ = stream.shutdown().await;
            drop(stream);
            return Err(Error::Proxy {
                status: Some(code),
                message: format!("proxy connection failed: {} {}", code, reason),
            });
        }

        Ok(Transport::from_tcp(stream))
    }

    fn name(&self) -> &'static str {
        "http-connect"
    }
}

async fn read_response_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = match stream.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        };
        head.push(byte);

        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Proxy {
                status: None,
                message: "proxy response head too large".into(),
            });
        }
    }
}

fn parse_status(head: &[u8]) -> Result<(u16, String)> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {
            let code = response.code.ok_or_else(|| Error::Proxy {
                status: None,
                message: "proxy response has no status code".into(),
            })?;
            Ok((code, response.reason.unwrap_or("").to_string()))
        }
        Ok(httparse::Status::Partial) => Err(Error::Proxy {
            status: None,
            message: "incomplete proxy response".into(),
        }),
        Err(e) => Err(Error::Proxy {
            status: None,
            message: format!("malformed proxy response: {}", e),
        }),
    }
}
