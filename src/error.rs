//! Error types
//!
//! Every failure the broker can report maps onto one [`ErrorClass`]. The retry
//! loop only ever inspects the class (plus the proxy status for tunnels), never
//! the concrete variant.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification reported to callers and consumed by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid configuration or local material; detected before any network call
    Config,
    /// Credential provider failure (STS, Azure AD, token signing)
    Auth,
    /// HTTP CONNECT / SOCKS tunnel refused by the proxy
    Proxy,
    /// Dial or ping failure without a recognized engine/cloud error code
    TransientNetwork,
    /// Failure carrying a database engine or cloud API error code
    FatalEngine,
    /// Caller canceled the operation
    Canceled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Proxy => "proxy",
            Self::TransientNetwork => "transient-network",
            Self::FatalEngine => "fatal-engine",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Error reported by the server in an ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// MySQL error number (e.g. 1045 for access denied)
    pub code: u16,
    /// Five-character SQLSTATE, when the server sent one
    pub sql_state: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "Error {} ({}): {}", self.code, state, self.message),
            None => write!(f, "Error {}: {}", self.code, self.message),
        }
    }
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, TLS material, or conflicting credential sources
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Credential provider failure
    #[error("{provider} credential error: {message}")]
    Auth {
        /// Provider name (`aws`, `azure`, `gcp`)
        provider: &'static str,
        /// Provider error, surfaced verbatim
        message: String,
    },

    /// Proxy refused or broke the tunnel
    #[error("proxy error: {message}")]
    Proxy {
        /// HTTP status returned by a CONNECT proxy, if any
        status: Option<u16>,
        /// Description
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected protocol data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS handshake rejected the peer
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server returned an ERR packet
    #[error("server error: {0}")]
    Server(ServerError),

    /// Cloud SQL Admin API returned an error status
    #[error("cloud SQL error {code}: {message}")]
    Cloud {
        /// HTTP status code of the API response
        code: u16,
        /// Error body
        message: String,
    },

    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid connection state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Caller canceled the operation
    #[error("operation canceled")]
    Canceled,

    /// Retry budget exhausted; wraps the last transient failure
    #[error("could not connect to {endpoint} within {timeout:?}: {source}")]
    RetryTimeout {
        /// Attempted endpoint
        endpoint: String,
        /// Configured budget
        timeout: Duration,
        /// Last failure observed
        #[source]
        source: Box<Error>,
    },

    /// Terminal connect failure with the attempted endpoint attached
    #[error("could not connect to {endpoint} ({class}): {source}")]
    Connect {
        /// Attempted endpoint
        endpoint: String,
        /// Classification of the underlying failure
        class: ErrorClass,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Classify this error into the broker taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_) | Error::Tls(_) | Error::InvalidState { .. } => ErrorClass::Config,
            Error::Auth { .. } => ErrorClass::Auth,
            Error::Proxy { .. } => ErrorClass::Proxy,
            Error::Io(_) | Error::Protocol(_) | Error::ConnectionClosed => {
                ErrorClass::TransientNetwork
            }
            Error::Server(_) | Error::Cloud { .. } => ErrorClass::FatalEngine,
            Error::Canceled => ErrorClass::Canceled,
            Error::RetryTimeout { .. } => ErrorClass::TransientNetwork,
            Error::Connect { class, .. } => *class,
        }
    }

    /// Whether a connect attempt failing with this error may be retried
    ///
    /// Proxies answering 5xx usually mean the target is not accepting yet,
    /// so those are retried even though they are classified as proxy errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Proxy {
                status: Some(status),
                ..
            } => (500..600).contains(status),
            Error::Connect { source, .. } => source.is_retryable(),
            _ => self.class() == ErrorClass::TransientNetwork,
        }
    }

    /// MySQL error number carried by this error, if any
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(err) => Some(err.code),
            Error::RetryTimeout { source, .. } | Error::Connect { source, .. } => {
                source.server_code()
            }
            _ => None,
        }
    }

    /// Cloud SQL API status carried by this error, if any
    pub fn cloud_code(&self) -> Option<u16> {
        match self {
            Error::Cloud { code, .. } => Some(*code),
            Error::RetryTimeout { source, .. } | Error::Connect { source, .. } => {
                source.cloud_code()
            }
            _ => None,
        }
    }

    pub(crate) fn auth(provider: &'static str, message: impl Into<String>) -> Self {
        Error::Auth {
            provider,
            message: message.into(),
        }
    }
}
