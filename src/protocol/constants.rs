//! MySQL protocol constants

/// Only handshake protocol version 10 is supported
pub const PROTOCOL_VERSION: u8 = 10;

/// Largest payload a single packet can carry; longer payloads are split
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;

/// Maximum packet size announced to the server in the handshake response
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Upper bound on a reassembled payload accepted from the server (64 MiB)
pub const MAX_REASSEMBLED_LEN: usize = 64 * 1024 * 1024;

/// utf8mb4_general_ci
pub const DEFAULT_COLLATION: u8 = 45;

/// Capability flags
pub mod capabilities {
    /// Use the improved version of old password authentication
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    /// Send found rows instead of affected rows
    pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
    /// Longer column flags
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    /// Database name may be specified on connect
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    /// 4.1 protocol
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    /// Switch to TLS after the handshake
    pub const CLIENT_SSL: u32 = 0x0000_0800;
    /// Transaction status flags in OK packets
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    /// 4.1 authentication
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    /// Multiple statements per COM_QUERY
    pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
    /// Multiple result sets
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    /// Pluggable authentication
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    /// Connection attributes
    pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
    /// Length-encoded auth response in the handshake response
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
    /// OK packets replace EOF packets
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
}

/// Command bytes
pub mod commands {
    /// Close the session
    pub const COM_QUIT: u8 = 0x01;
    /// Text protocol query
    pub const COM_QUERY: u8 = 0x03;
    /// Liveness check
    pub const COM_PING: u8 = 0x0E;
}

/// First byte of a response payload
pub mod markers {
    /// OK packet
    pub const OK: u8 = 0x00;
    /// Auth "more data" packet
    pub const AUTH_MORE_DATA: u8 = 0x01;
    /// LOCAL INFILE request
    pub const LOCAL_INFILE: u8 = 0xFB;
    /// EOF packet (and auth switch request during authentication)
    pub const EOF: u8 = 0xFE;
    /// ERR packet
    pub const ERR: u8 = 0xFF;
    /// NULL column value in a text row
    pub const NULL_VALUE: u8 = 0xFB;
}

/// Authentication plugin names
pub mod auth_plugins {
    /// SHA1-based scramble
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based scramble with server-side cache
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// Password sent as-is (IAM tokens, AAD tokens)
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// caching_sha2_password status bytes carried in "more data" packets
pub mod caching_sha2 {
    /// Client asks for the server RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Scramble matched the server cache
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Server needs the full password
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Server status flags
pub mod status {
    /// More result sets follow
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// Server error numbers the broker and its callers care about
pub mod error_codes {
    /// Access denied for user
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    /// Host is not allowed to connect
    pub const ER_HOST_NOT_PRIVILEGED: u16 = 1130;
    /// Can't find any matching row in the user table
    pub const ER_PASSWORD_NO_MATCH: u16 = 1133;
    /// Operation failed for user (unknown user on DROP USER)
    pub const ER_CANNOT_USER: u16 = 1396;
}
