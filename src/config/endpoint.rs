//! Endpoint parsing
//!
//! Supports formats:
//! * `host`, `host:port`, `[v6addr]:port` (TCP, port defaults to 3306)
//! * `/path/to/mysqld.sock` (Unix socket)
//! * `aws://host[:port]`, `azure://host[:port]` (TCP with token authentication)
//! * `cloudsql://project:region:instance` (Cloud SQL connector)

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// Default MySQL port
pub const DEFAULT_PORT: u16 = 3306;

/// Scheme prefix of an endpoint string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointScheme {
    /// No prefix
    Plain,
    /// Leading `/`
    Unix,
    /// `aws://`
    Aws,
    /// `azure://`
    Azure,
    /// `cloudsql://`
    CloudSql,
}

impl EndpointScheme {
    /// Detect the scheme of a raw endpoint
    pub fn of(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with('/') {
            EndpointScheme::Unix
        } else if raw.starts_with("aws://") {
            EndpointScheme::Aws
        } else if raw.starts_with("azure://") {
            EndpointScheme::Azure
        } else if raw.starts_with("cloudsql://") {
            EndpointScheme::CloudSql
        } else {
            EndpointScheme::Plain
        }
    }
}

impl fmt::Display for EndpointScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointScheme::Plain => "tcp",
            EndpointScheme::Unix => "unix",
            EndpointScheme::Aws => "aws://",
            EndpointScheme::Azure => "azure://",
            EndpointScheme::CloudSql => "cloudsql://",
        };
        f.write_str(name)
    }
}

/// Where the broker connects to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP host and port
    Tcp {
        /// Hostname or IP literal (without brackets)
        host: String,
        /// Port
        port: u16,
    },
    /// Unix domain socket
    Unix(PathBuf),
    /// Cloud SQL instance connection name
    CloudSql {
        /// `project:region:instance`
        instance: String,
    },
}

impl Endpoint {
    /// Parse an endpoint string
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Config("endpoint must not be an empty string".into()));
        }

        match EndpointScheme::of(raw) {
            EndpointScheme::Unix => Ok(Endpoint::Unix(PathBuf::from(raw))),
            EndpointScheme::CloudSql => {
                let instance = raw.trim_start_matches("cloudsql://");
                Self::parse_cloudsql(instance)
            }
            EndpointScheme::Aws => Self::parse_tcp(raw.trim_start_matches("aws://")),
            EndpointScheme::Azure => Self::parse_tcp(raw.trim_start_matches("azure://")),
            EndpointScheme::Plain => Self::parse_tcp(raw),
        }
    }

    fn parse_cloudsql(instance: &str) -> Result<Self> {
        let parts: Vec<&str> = instance.split(':').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Config(format!(
                "cloudsql endpoint must be cloudsql://project:region:instance (got {:?})",
                instance
            )));
        }
        Ok(Endpoint::CloudSql {
            instance: instance.to_string(),
        })
    }

    fn parse_tcp(addr: &str) -> Result<Self> {
        let (host, port) = split_host_port(addr)?;
        if host.is_empty() {
            return Err(Error::Config(format!("endpoint {:?} has no host", addr)));
        }
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port: port.unwrap_or(DEFAULT_PORT),
        })
    }

    /// `host:port` for TCP (IPv6 bracketed), the path for Unix, the instance name for Cloud SQL
    pub fn address(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => join_host_port(host, *port),
            Endpoint::Unix(path) => path.display().to_string(),
            Endpoint::CloudSql { instance } => instance.clone(),
        }
    }

    /// Hostname for TLS server name checks
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp { host, .. } => Some(host),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { .. } => write!(f, "tcp({})", self.address()),
            Endpoint::Unix(path) => write!(f, "unix({})", path.display()),
            Endpoint::CloudSql { instance } => write!(f, "cloudsql({})", instance),
        }
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals
pub fn split_host_port(addr: &str) -> Result<(&str, Option<u16>)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port {:?} in {:?}", p, addr)))
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("unterminated IPv6 literal in {:?}", addr)))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(Error::Config(format!("invalid address {:?}", addr))),
        };
    }

    match addr.matches(':').count() {
        0 => Ok((addr, None)),
        1 => {
            let (host, port) = addr.split_once(':').unwrap_or((addr, ""));
            Ok((host, Some(parse_port(port)?)))
        }
        // Bare IPv6 literal without brackets
        _ => Ok((addr, None)),
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
