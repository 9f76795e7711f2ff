//! Connection management
//!
//! This module handles:
//! * Transport abstraction (TCP, TLS, Unix socket)
//! * Connection lifecycle (greeting, TLS upgrade, auth, commands)
//! * State machine enforcement
//! * TLS configuration and the named TLS registry

mod conn;
mod state;
mod tls;
mod transport;

pub use conn::{Connection, ConnectionConfig, ConnectionConfigBuilder};
pub use state::ConnectionState;
pub use tls::{server_name, TlsConfig, TlsConfigBuilder, TlsMode, TlsRegistry};
pub use transport::{TcpVariant, Transport};

pub(crate) use tls::crypto_provider;
