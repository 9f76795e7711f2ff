//! The connection handle handed to callers

use crate::connection::Connection;
use crate::protocol::{OkPacket, ResultSet};
use crate::version::ServerVersion;
use crate::Result;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Server implementation detected by the probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flavor {
    /// Data directory contains `rds`
    pub rds: bool,
    /// TiDB product version (e.g. `v7.1.0`) when the banner carries the marker
    pub tidb_version: Option<String>,
    /// MySQL version a TiDB server claims compatibility with
    pub mysql_compat_version: Option<String>,
    /// Banner carries the MariaDB marker
    pub mariadb: bool,
}

impl Flavor {
    /// Whether the server is TiDB
    pub fn is_tidb(&self) -> bool {
        self.tidb_version.is_some()
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        if self.is_tidb() {
            "tidb"
        } else if self.mariadb {
            "mariadb"
        } else if self.rds {
            "rds"
        } else {
            "mysql"
        }
    }
}

/// A ready connection with its probed version and flavor
///
/// The record owns exactly one physical connection. Statements issued through
/// it are serialized on that connection; it is never re-dialed. A severed
/// connection surfaces as an error from the next statement.
pub struct ConnectionRecord {
    conn: Mutex<Connection>,
    version: ServerVersion,
    flavor: Flavor,
    dsn: String,
    max_lifetime: Option<Duration>,
    created_at: Instant,
}

impl ConnectionRecord {
    /// Wrap a normalized, probed connection
    pub fn new(
        conn: Connection,
        version: ServerVersion,
        flavor: Flavor,
        dsn: String,
        max_lifetime: Option<Duration>,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            version,
            flavor,
            dsn,
            max_lifetime,
            created_at: Instant::now(),
        }
    }

    /// Server version
    pub fn version(&self) -> &ServerVersion {
        &self.version
    }

    /// Detected flavor
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    /// Managed RDS server
    pub fn is_rds(&self) -> bool {
        self.flavor.rds
    }

    /// TiDB server
    pub fn is_tidb(&self) -> bool {
        self.flavor.is_tidb()
    }

    /// MariaDB server
    pub fn is_mariadb(&self) -> bool {
        self.flavor.mariadb
    }

    /// TiDB product version
    pub fn tidb_version(&self) -> Option<&str> {
        self.flavor.tidb_version.as_deref()
    }

    /// MySQL compatibility version advertised by TiDB
    pub fn mysql_compat_version(&self) -> Option<&str> {
        self.flavor.mysql_compat_version.as_deref()
    }

    /// DSN the connection was made with (password masked)
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Configured lifetime hint; not enforced
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime
    }

    /// Time since the connection became ready
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Run a statement, returning its OK packet
    pub async fn execute(&self, sql: &str) -> Result<OkPacket> {
        self.conn.lock().await.execute(sql).await
    }

    /// Run a statement, returning its rows
    pub async fn query(&self, sql: &str) -> Result<ResultSet> {
        self.conn.lock().await.query(sql).await
    }

    /// First column of the first row (`None` for no rows or NULL)
    pub async fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        let rows = self.query(sql).await?;
        Ok(rows.first_value().map(str::to_string))
    }

    /// COM_PING
    pub async fn ping(&self) -> Result<()> {
        self.conn.lock().await.ping().await
    }

    /// Send COM_QUIT and close the socket
    pub async fn close(self) -> Result<()> {
        self.conn.into_inner().close().await
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("dsn", &self.dsn)
            .field("version", &self.version.to_string())
            .field("flavor", &self.flavor.name())
            .finish_non_exhaustive()
    }
}
