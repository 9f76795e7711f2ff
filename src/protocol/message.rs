//! Protocol message types

use crate::error::ServerError;
use bytes::Bytes;

/// A single framed packet as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence id from the packet header
    pub sequence: u8,
    /// Payload without the 4-byte header
    pub payload: Bytes,
}

/// Frontend message (client → server)
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Truncated handshake response asking the server to switch to TLS
    SslRequest {
        /// Client capability flags (must include `CLIENT_SSL`)
        capabilities: u32,
        /// Connection collation id
        collation: u8,
    },

    /// HandshakeResponse41
    HandshakeResponse(HandshakeResponse),

    /// Raw authentication data (auth switch reply, full-auth password, key request)
    AuthData(Vec<u8>),

    /// Command phase packet
    Command(Command),
}

/// Client handshake response
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    /// Client capability flags
    pub capabilities: u32,
    /// Maximum packet size the client accepts
    pub max_packet_size: u32,
    /// Connection collation id
    pub collation: u8,
    /// Account name
    pub username: String,
    /// Plugin-specific auth response
    pub auth_response: Vec<u8>,
    /// Default schema, if any
    pub database: Option<String>,
    /// Auth plugin the response was computed with
    pub auth_plugin: String,
    /// Connection attributes (sent when `CLIENT_CONNECT_ATTRS` is set)
    pub attributes: Vec<(String, String)>,
}

/// Command phase request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// COM_QUERY with SQL text
    Query(String),
    /// COM_PING
    Ping,
    /// COM_QUIT
    Quit,
}

/// Initial handshake sent by the server (protocol v10)
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol version (always 10)
    pub protocol_version: u8,
    /// Server version banner, e.g. `8.0.36` or `5.7.25-TiDB-v7.1.0`
    pub server_version: String,
    /// Server thread id
    pub connection_id: u32,
    /// Auth plugin data (20 bytes for the built-in plugins)
    pub scramble: Vec<u8>,
    /// Server capability flags
    pub capabilities: u32,
    /// Server default collation
    pub collation: u8,
    /// Server status flags
    pub status_flags: u16,
    /// Default auth plugin announced by the server
    pub auth_plugin: String,
}

/// OK packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Rows affected by the last statement
    pub affected_rows: u64,
    /// Last generated AUTO_INCREMENT value
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Warning count
    pub warnings: u16,
    /// Human-readable info string
    pub info: String,
}

/// Auth switch request (0xFE during authentication)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    /// Plugin the server wants the client to use
    pub plugin: String,
    /// New scramble for that plugin
    pub data: Vec<u8>,
}

/// Server reply during the authentication phase
#[derive(Debug, Clone)]
pub enum AuthReply {
    /// Authentication succeeded
    Ok(OkPacket),
    /// Authentication failed
    Err(ServerError),
    /// Server asks for a different plugin
    Switch(AuthSwitchRequest),
    /// Plugin-specific continuation (caching_sha2 status byte, PEM public key)
    MoreData(Vec<u8>),
}

/// First reply to COM_QUERY
#[derive(Debug, Clone)]
pub enum QueryReply {
    /// Statement without a result set
    Ok(OkPacket),
    /// Statement failed
    Err(ServerError),
    /// Result set follows with this many columns
    ResultSet {
        /// Number of column definitions that follow
        column_count: u64,
    },
    /// Server asks for a client-side file (never honored)
    LocalInfile(String),
}

/// Column definition (Protocol::ColumnDefinition41)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Schema name
    pub schema: String,
    /// Virtual table name
    pub table: String,
    /// Virtual column name (alias)
    pub name: String,
    /// Collation id
    pub collation: u16,
    /// Column display length
    pub column_length: u32,
    /// Column type byte
    pub column_type: u8,
    /// Column flags
    pub flags: u16,
    /// Decimal digits
    pub decimals: u8,
}

/// Text protocol result set
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Column definitions
    pub columns: Vec<ColumnDefinition>,
    /// Rows; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// Index of a column by name (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// First column of the first row, if present and not NULL
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }

    /// Values of one column across all rows
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = Option<&str>> {
        self.rows
            .iter()
            .map(move |row| row.get(index).and_then(|v| v.as_deref()))
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result set has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
