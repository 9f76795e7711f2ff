//! Version and flavor probing

use crate::client::Flavor;
use crate::connection::Connection;
use crate::version::ServerVersion;
use crate::{Error, Result};

/// Query returning the version banner
pub const VERSION_QUERY: &str = "SELECT @@GLOBAL.version";

/// Query returning the data directory
pub const DATADIR_QUERY: &str = "SELECT @@GLOBAL.datadir";

const TIDB_MARKER: &str = "TiDB";
const MARIADB_MARKER: &str = "MariaDB";
const RDS_MARKER: &str = "rds";

/// Derive the flavor from a version banner and data directory
///
/// A TiDB banner has the shape `<mysql-compat>-TiDB-<product>`; the product
/// part keeps any further dashes (`v7.5.0-alpha`).
pub fn parse_flavor(banner: &str, datadir: &str) -> Flavor {
    let mut flavor = Flavor {
        rds: datadir.contains(RDS_MARKER),
        mariadb: banner.contains(MARIADB_MARKER),
        ..Default::default()
    };

    if banner.contains(TIDB_MARKER) {
        let parts: Vec<&str> = banner.splitn(3, '-').collect();
        flavor.mysql_compat_version = parts.first().map(|s| s.to_string());
        flavor.tidb_version = Some(parts.get(2).copied().unwrap_or_default().to_string());
    }

    flavor
}

/// Fetch the version banner of a logged-in connection
pub async fn server_version(conn: &mut Connection) -> Result<(String, ServerVersion)> {
    let rows = conn.query(VERSION_QUERY).await?;
    let banner = rows
        .first_value()
        .ok_or_else(|| Error::Protocol("server returned no version".into()))?
        .to_string();
    let version = ServerVersion::parse(&banner)?;
    Ok((banner, version))
}

/// Fetch the data directory; NULL reads as empty
pub async fn datadir(conn: &mut Connection) -> Result<String> {
    let rows = conn.query(DATADIR_QUERY).await?;
    Ok(rows.first_value().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tidb_banner() {
        let flavor = parse_flavor("5.7.20-TiDB-v7.1.0", "/data/tidb");
        assert!(flavor.is_tidb());
        assert_eq!(flavor.mysql_compat_version.as_deref(), Some("5.7.20"));
        assert_eq!(flavor.tidb_version.as_deref(), Some("v7.1.0"));
        assert!(!flavor.rds);
    }

    #[test]
    fn test_tidb_product_keeps_dashes() {
        let flavor = parse_flavor("8.0.11-TiDB-v7.5.0-alpha", "");
        assert_eq!(flavor.tidb_version.as_deref(), Some("v7.5.0-alpha"));
    }

    #[test]
    fn test_rds_datadir() {
        assert!(parse_flavor("8.0.35", "/rdsdbdata/db/").rds);
        assert!(parse_flavor("8.0.35", "/var/lib/rds").rds);
        assert!(!parse_flavor("8.0.35", "/var/lib/mysql/").rds);
    }

    #[test]
    fn test_mariadb_banner() {
        let flavor = parse_flavor("10.11.6-MariaDB-1:10.11.6+maria~ubu2204", "/var/lib/mysql/");
        assert!(flavor.mariadb);
        assert!(!flavor.is_tidb());
        assert_eq!(flavor.name(), "mariadb");
    }

    #[test]
    fn test_plain_mysql() {
        assert_eq!(parse_flavor("8.0.36", "/var/lib/mysql/"), Flavor::default());
    }
}
