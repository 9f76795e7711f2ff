//! mysql-broker
//!
//! Turns a declarative [`Configuration`] into exactly one live, version-probed,
//! session-normalized MySQL connection. Credentials may come from a static
//! password, AWS RDS IAM tokens (optionally through STS role assumption), Azure
//! AD tokens, or the Cloud SQL connector. Connections may be dialed directly,
//! over a Unix socket, or through SOCKS5 / HTTP CONNECT proxies, with optional
//! named TLS contexts.
//!
//! ```no_run
//! # async fn example() -> mysql_broker::Result<()> {
//! use mysql_broker::{Configuration, ConnectionBroker, ConnectionCache};
//! use tokio_util::sync::CancellationToken;
//!
//! let cache = ConnectionCache::new(ConnectionBroker::new());
//! let config = Configuration::builder("db.internal:3306", "admin")
//!     .password("secret")
//!     .build();
//!
//! let record = cache.get_or_create(&config, &CancellationToken::new()).await?;
//! println!("connected to {} (rds: {})", record.version(), record.is_rds());
//! record.execute("CREATE DATABASE IF NOT EXISTS app").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod broker;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod net;
pub mod protocol;
pub mod version;

pub use broker::ConnectionBroker;
pub use cache::{CacheKey, ConnectionCache};
pub use client::{ConnectionRecord, Flavor};
pub use config::Configuration;
pub use error::{Error, ErrorClass, Result, ServerError};
pub use version::ServerVersion;
