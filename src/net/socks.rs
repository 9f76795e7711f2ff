//! SOCKS5 tunneling (RFC 1928, username/password per RFC 1929)
//!
//! `socks5://` resolves the target locally and sends an IP address;
//! `socks5h://` sends the hostname and lets the proxy resolve it.

use super::{Dialer, ProxyScheme, ProxySpec};
use crate::config::Endpoint;
use crate::connection::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dialer that tunnels through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy: ProxySpec,
}

/// Destination address as sent in the CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksDialer {
    /// Create a dialer for the given proxy
    pub fn new(proxy: ProxySpec) -> Self {
        Self { proxy }
    }

    async fn target_addr(&self, host: &str, port: u16) -> Result<TargetAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
        }
        if self.proxy.scheme == ProxyScheme::Socks5h {
            return Ok(TargetAddr::Domain(host.to_string(), port));
        }

        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        addrs.next().map(TargetAddr::Ip).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {}", host),
            ))
        })
    }

    async fn negotiate_method(&self, stream: &mut TcpStream) -> Result<()> {
        let credentials = self.proxy.username.is_some();
        let greeting: &[u8] = if credentials {
            &[VERSION, 2, METHOD_NONE, METHOD_USER_PASS]
        } else {
            &[VERSION, 1, METHOD_NONE]
        };
        stream.write_all(greeting).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != VERSION {
            return Err(socks_error(format!("unexpected SOCKS version {}", reply[0])));
        }

        match reply[1] {
            METHOD_NONE => Ok(()),
            METHOD_USER_PASS if credentials => self.authenticate(stream).await,
            METHOD_UNACCEPTABLE => Err(socks_error("no acceptable authentication method")),
            other => Err(socks_error(format!(
                "proxy selected unsupported authentication method {:#04x}",
                other
            ))),
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let user = self.proxy.username.as_deref().unwrap_or("").as_bytes();
        let pass = self.proxy.password.as_deref().unwrap_or("").as_bytes();
        if user.len() > 255 || pass.len() > 255 {
            return Err(Error::Config(
                "SOCKS5 username and password must be at most 255 bytes".into(),
            ));
        }

        let mut request = Vec::with_capacity(3 + user.len() + pass.len());
        request.push(AUTH_VERSION);
        request.push(user.len() as u8);
        request.extend_from_slice(user);
        request.push(pass.len() as u8);
        request.extend_from_slice(pass);
        stream.write_all(&request).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(socks_error("username/password authentication failed"));
        }
        Ok(())
    }

    async fn connect(&self, stream: &mut TcpStream, target: &TargetAddr) -> Result<()> {
        stream.write_all(&connect_request(target)?).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(socks_error(format!("unexpected SOCKS version {}", head[0])));
        }
        if head[1] != 0x00 {
            return Err(reply_error(head[1]));
        }

        // Bound address is not used, but must be drained
        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => stream.read_u8().await? as usize,
            other => return Err(socks_error(format!("unknown address type {}", other))),
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

#[async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, target: &Endpoint) -> Result<Transport> {
        let (host, port) = match target {
            Endpoint::Tcp { host, port } => (host.as_str(), *port),
            other => {
                return Err(Error::Config(format!(
                    "{} cannot be reached through a SOCKS proxy",
                    other
                )))
            }
        };

        tracing::debug!(proxy = %self.proxy, target = %target, "opening SOCKS5 tunnel");

        let target = self.target_addr(host, port).await?;
        let mut stream = TcpStream::connect((self.proxy.host.as_str(), self.proxy.port)).await?;
        let _ = stream.set_nodelay(true);

        self.negotiate_method(&mut stream).await?;
        self.connect(&mut stream, &target).await?;

        Ok(Transport::from_tcp(stream))
    }

    fn name(&self) -> &'static str {
        match self.proxy.scheme {
            ProxyScheme::Socks5h => "socks5h",
            _ => "socks5",
        }
    }
}

fn connect_request(target: &TargetAddr) -> Result<Vec<u8>> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    let port = match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.ip().octets());
            addr.port()
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr.ip().octets());
            addr.port()
        }
        TargetAddr::Domain(host, port) => {
            if host.len() > 255 {
                return Err(Error::Config(format!("hostname {} is too long for SOCKS5", host)));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
            *port
        }
    };
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> String {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    };
    format!("SOCKS5 connect failed: {} ({:#04x})", reason, code)
}

/// Map a failed CONNECT reply onto an error
///
/// Failures on the proxy's side of the tunnel (target refused, unreachable,
/// TTL expired) carry no engine code and are retried like a direct refusal.
/// Ruleset denials and protocol mismatches stay proxy errors.
fn reply_error(code: u8) -> Error {
    let kind = match code {
        0x05 => std::io::ErrorKind::ConnectionRefused,
        0x06 => std::io::ErrorKind::TimedOut,
        0x01 | 0x03 | 0x04 => std::io::ErrorKind::Other,
        _ => return socks_error(reply_message(code)),
    };
    Error::Io(std::io::Error::new(kind, reply_message(code)))
}

fn socks_error(message: impl Into<String>) -> Error {
    Error::Proxy {
        status: None,
        message: message.into(),
    }
}
