//! Network dialing
//!
//! A [`DialSpec`] says how to reach the server: directly, over a Unix socket,
//! or through a SOCKS5 / HTTP CONNECT proxy. [`DialSpec::dialer`] turns it into
//! a [`Dialer`] that yields a [`Transport`] the protocol layer can log in over.
//!
//! The proxy is taken from `Configuration::proxy` when set; otherwise
//! `ALL_PROXY` / `all_proxy` is consulted, honouring `NO_PROXY` / `no_proxy`.

pub mod direct;
pub mod http_connect;
pub mod socks;

pub use direct::DirectDialer;
pub use http_connect::HttpConnectDialer;
pub use socks::SocksDialer;

use crate::config::endpoint::{join_host_port, split_host_port};
use crate::config::{Configuration, Endpoint};
use crate::connection::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::sync::Arc;

/// Opens byte streams to a MySQL endpoint
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Open a transport to `target`
    async fn dial(&self, target: &Endpoint) -> Result<Transport>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Proxy URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    /// SOCKS5, target resolved locally
    Socks5,
    /// SOCKS5, target resolved by the proxy
    Socks5h,
    /// HTTP CONNECT
    Http,
    /// HTTP CONNECT (the proxy itself is reached over plain TCP)
    Https,
}

impl ProxyScheme {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "socks5" => Some(ProxyScheme::Socks5),
            "socks5h" => Some(ProxyScheme::Socks5h),
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            _ => None,
        }
    }

    /// URL scheme string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks5h => "socks5h",
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        }
    }

    /// Whether this is a SOCKS proxy
    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyScheme::Socks5 | ProxyScheme::Socks5h)
    }
}

/// Parsed proxy URL `scheme://[user[:password]@]host:port`
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySpec {
    /// Scheme
    pub scheme: ProxyScheme,
    /// Proxy host (IPv6 without brackets)
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Username from the userinfo, percent-decoded
    pub username: Option<String>,
    /// Password from the userinfo, percent-decoded
    pub password: Option<String>,
}

impl ProxySpec {
    /// Parse and validate a proxy URL
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || {
            Error::Config(
                "The proxy URL is not a valid proxy url. Must be in format: socks5://host:port, http://host:port, or https://host:port"
                    .into(),
            )
        };

        let (scheme, rest) = raw.split_once("://").ok_or_else(invalid)?;
        let scheme = ProxyScheme::parse(scheme).ok_or_else(invalid)?;

        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, rest),
        };

        let (host, port) = split_host_port(hostport).map_err(|_| invalid())?;
        let port = port.ok_or_else(invalid)?;
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }

        let (username, password) = match userinfo {
            Some(info) => {
                let (user, pass) = match info.split_once(':') {
                    Some((user, pass)) => (user, Some(pass)),
                    None => (info, None),
                };
                (Some(decode_userinfo(user)?), pass.map(decode_userinfo).transpose()?)
            }
            None => (None, None),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// `host:port` of the proxy
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// URL with the password masked, for logs and cache keys
    pub fn masked(&self) -> String {
        let userinfo = match (&self.username, &self.password) {
            (Some(user), Some(_)) => format!("{}:***@", user),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        };
        format!("{}://{}{}", self.scheme.as_str(), userinfo, self.address())
    }

    /// `Proxy-Authorization` value; only sent when a password is present
    pub fn basic_auth(&self) -> Option<String> {
        let password = self.password.as_deref()?;
        let user = self.username.as_deref().unwrap_or("");
        Some(format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", user, password))
        ))
    }

    /// Proxy from `ALL_PROXY` / `all_proxy` unless `NO_PROXY` exempts `target_host`
    pub fn from_env_with<F>(lookup: F, target_host: &str) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let Some(raw) = get("ALL_PROXY").or_else(|| get("all_proxy")) else {
            return Ok(None);
        };

        let no_proxy = get("NO_PROXY").or_else(|| get("no_proxy")).unwrap_or_default();
        if bypasses_proxy(&no_proxy, target_host) {
            tracing::debug!(host = %target_host, "NO_PROXY matches target, dialing directly");
            return Ok(None);
        }

        Self::parse(&raw).map(Some)
    }
}

impl fmt::Debug for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Display for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

fn decode_userinfo(value: &str) -> Result<String> {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .map_err(|_| Error::Config("proxy userinfo is not valid UTF-8 after decoding".into()))
}

/// Whether a `NO_PROXY` list exempts `host`
///
/// Entries are exact hosts, domain suffixes (with or without a leading dot),
/// `host:port` (port ignored), or `*`.
pub fn bypasses_proxy(no_proxy: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    no_proxy
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let entry = split_host_port(entry)
                .map(|(h, _)| h)
                .unwrap_or(entry)
                .trim_start_matches("*.")
                .trim_start_matches('.')
                .to_ascii_lowercase();
            host == entry || host.ends_with(&format!(".{}", entry))
        })
}

/// Network kind of a dial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    /// Direct TCP
    Tcp,
    /// Unix domain socket
    Unix,
    /// TCP through a proxy tunnel
    Proxied,
    /// Cloud SQL connector
    CloudSql,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkKind::Tcp => "tcp",
            NetworkKind::Unix => "unix",
            NetworkKind::Proxied => "proxied",
            NetworkKind::CloudSql => "cloudsql",
        };
        f.write_str(name)
    }
}

/// How to reach the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialSpec {
    /// Network kind
    pub kind: NetworkKind,
    /// Target endpoint
    pub target: Endpoint,
    /// Proxy tunnel, when `kind` is `Proxied`
    pub proxy: Option<ProxySpec>,
}

impl DialSpec {
    /// Select the dial path for a configuration using the process environment
    pub fn from_config(config: &Configuration) -> Result<Self> {
        Self::from_config_with(config, |key| std::env::var(key).ok())
    }

    /// Select the dial path with an arbitrary environment lookup
    pub fn from_config_with<F>(config: &Configuration, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target = config.endpoint()?;

        let host = match &target {
            Endpoint::Unix(_) => {
                return Ok(Self {
                    kind: NetworkKind::Unix,
                    target,
                    proxy: None,
                })
            }
            Endpoint::CloudSql { .. } => {
                return Ok(Self {
                    kind: NetworkKind::CloudSql,
                    target,
                    proxy: None,
                })
            }
            Endpoint::Tcp { host, .. } => host.clone(),
        };

        let proxy = match config.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(raw) => Some(ProxySpec::parse(raw)?),
            None => ProxySpec::from_env_with(lookup, &host)?,
        };

        let kind = if proxy.is_some() {
            NetworkKind::Proxied
        } else {
            NetworkKind::Tcp
        };

        Ok(Self {
            kind,
            target,
            proxy,
        })
    }

    /// Dialer for this route
    ///
    /// Cloud SQL endpoints are dialed by the connector the credential source
    /// supplies; the direct dialer rejects them.
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        match &self.proxy {
            Some(proxy) if proxy.scheme.is_socks() => Arc::new(SocksDialer::new(proxy.clone())),
            Some(proxy) => Arc::new(HttpConnectDialer::new(proxy.clone())),
            None => Arc::new(DirectDialer),
        }
    }
}
