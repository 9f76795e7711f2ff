//! Session normalization
//!
//! Servers in `[5.7.5, 8.0.0)` get `NO_AUTO_CREATE_USER` so `GRANT` never
//! creates accounts implicitly; everything else gets an empty SQL mode. Either
//! way `ANSI_QUOTES` is off and identifiers are quoted with backticks.

use crate::version::ServerVersion;

const NO_AUTO_CREATE_USER_SINCE: ServerVersion = ServerVersion::new(5, 7, 5);
const NO_AUTO_CREATE_USER_UNTIL: ServerVersion = ServerVersion::new(8, 0, 0);

/// Statement that fixes the session SQL mode for `version`
pub fn session_statement(version: &ServerVersion) -> &'static str {
    if version.in_range(&NO_AUTO_CREATE_USER_SINCE, &NO_AUTO_CREATE_USER_UNTIL) {
        "SET SESSION sql_mode='NO_AUTO_CREATE_USER'"
    } else {
        "SET SESSION sql_mode=''"
    }
}

/// Quote an identifier with backticks, doubling embedded backticks
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
