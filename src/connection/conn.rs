//! Core connection type

use super::state::ConnectionState;
use super::tls::TlsConfig;
use super::transport::Transport;
use crate::auth::password::{self, PluginPolicy};
use crate::metrics::labels;
use crate::protocol::constants::{
    auth_plugins, caching_sha2, capabilities::*, markers, status, DEFAULT_COLLATION,
    MAX_PACKET_SIZE,
};
use crate::protocol::decode::{
    check_reassembled_len, decode_auth_reply, decode_column_definition, decode_err,
    decode_handshake, decode_query_reply, decode_terminator_status, decode_text_row,
    is_continued, is_terminator,
};
use crate::protocol::{
    decode_packet, encode_message, frame_packet, AuthReply, Command, FrontendMessage, Handshake,
    HandshakeResponse, OkPacket, Packet, QueryReply, ResultSet,
};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Capabilities requested from every server (intersected with what it offers)
const CLIENT_CAPABILITIES: u32 = CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CLIENT_TRANSACTIONS
    | CLIENT_MULTI_RESULTS
    | CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG;

/// Upper bound on the column count of a result set
const MAX_COLUMNS: u64 = 4096;

/// Connection configuration
///
/// Everything the protocol layer needs to log in over an already dialed
/// transport. Use `ConnectionConfig::builder()` to assemble one.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Username
    pub user: String,
    /// Password or token (optional)
    pub password: Option<String>,
    /// Default schema
    pub database: Option<String>,
    /// TLS context; `None` keeps the channel in cleartext
    pub tls: Option<TlsConfig>,
    /// Server name checked against the certificate
    pub tls_server_name: Option<String>,
    /// Auth plugins the client may answer
    pub plugin_policy: PluginPolicy,
    /// Connection collation id
    pub collation: u8,
    /// `SET name=value` statements run right after login, in order
    pub session_variables: Vec<(String, String)>,
    /// Deadline for greeting, TLS and authentication
    pub connect_timeout: Option<Duration>,
}

impl ConnectionConfig {
    /// Create new configuration with defaults
    ///
    /// # Defaults
    ///
    /// - no password, no default schema, no TLS
    /// - `mysql_native_password` allowed, `mysql_clear_password` refused
    /// - `utf8mb4_general_ci` collation
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            database: None,
            tls: None,
            tls_server_name: None,
            plugin_policy: PluginPolicy {
                allow_cleartext: false,
                allow_native: true,
            },
            collation: DEFAULT_COLLATION,
            session_variables: Vec::new(),
            connect_timeout: None,
        }
    }

    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = ConnectionConfig::builder("admin")
    ///     .password("secret")
    ///     .tls(tls_config, "db.internal")
    ///     .connect_timeout(Duration::from_secs(10))
    ///     .build();
    /// ```
    pub fn builder(user: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: Self::new(user),
        }
    }

    /// Set password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn password_str(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("tls", &self.tls)
            .field("tls_server_name", &self.tls_server_name)
            .field("plugin_policy", &self.plugin_policy)
            .field("collation", &self.collation)
            .field("session_variables", &self.session_variables)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the password (or token)
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set the default schema
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Request TLS with the given context and server name
    pub fn tls(mut self, tls: TlsConfig, server_name: impl Into<String>) -> Self {
        self.config.tls = Some(tls);
        self.config.tls_server_name = Some(server_name.into());
        self
    }

    /// Set which auth plugins may be answered
    pub fn plugin_policy(mut self, policy: PluginPolicy) -> Self {
        self.config.plugin_policy = policy;
        self
    }

    /// Set the connection collation id
    pub fn collation(mut self, collation: u8) -> Self {
        self.config.collation = collation;
        self
    }

    /// Add a session variable set right after login
    pub fn session_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .session_variables
            .push((name.into(), value.into()));
        self
    }

    /// Set the login deadline
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = Some(duration);
        self
    }

    /// Build the configuration
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// MySQL connection
pub struct Connection {
    transport: Option<Transport>,
    state: ConnectionState,
    read_buf: BytesMut,
    sequence: u8,
    capabilities: u32,
    connection_id: u32,
    server_version: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.server_version)
            .field("tls", &self.transport.as_ref().is_some_and(|t| t.is_tls()))
            .finish()
    }
}

impl Connection {
    /// Create connection from transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            sequence: 0,
            capabilities: 0,
            connection_id: 0,
            server_version: String::new(),
        }
    }

    /// Log in over `transport`, honouring `config.connect_timeout`
    pub async fn establish(transport: Transport, config: &ConnectionConfig) -> Result<Self> {
        let mut conn = Self::new(transport);
        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.handshake(config))
                .await
                .map_err(|_| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("login did not complete within {:?}", limit),
                    ))
                })??,
            None => conn.handshake(config).await?,
        }
        Ok(conn)
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server thread id from the greeting
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Version banner from the greeting
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Negotiated capability flags
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Whether the channel is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_tls())
    }

    /// Read the greeting, negotiate TLS and authenticate
    pub async fn handshake(&mut self, config: &ConnectionConfig) -> Result<()> {
        async {
            let payload = self.read_packet().await?;
            if payload.first() == Some(&markers::ERR) {
                return Err(Error::Server(decode_err(&payload)?));
            }
            let greeting = decode_handshake(&payload)?;
            tracing::debug!(
                server_version = %greeting.server_version,
                connection_id = greeting.connection_id,
                auth_plugin = %greeting.auth_plugin,
                "received server greeting"
            );

            self.connection_id = greeting.connection_id;
            self.server_version = greeting.server_version.clone();
            self.capabilities = negotiate_capabilities(&greeting, config)?;

            if let Some(tls) = &config.tls {
                let host = config
                    .tls_server_name
                    .as_deref()
                    .ok_or_else(|| Error::Config("TLS negotiation requires a hostname".into()))?;
                self.negotiate_tls(tls, host, config.collation).await?;
            }

            self.state.transition(ConnectionState::Authenticating)?;
            self.authenticate(&greeting, config).await?;
            self.state.transition(ConnectionState::Idle)?;

            for (name, value) in &config.session_variables {
                self.execute(&format!("SET {}={}", name, value)).await?;
            }

            tracing::info!("login complete");
            Ok(())
        }
        .instrument(tracing::info_span!("handshake", user = %config.user))
        .await
    }

    /// Send the SSL request and upgrade the transport
    async fn negotiate_tls(&mut self, tls: &TlsConfig, hostname: &str, collation: u8) -> Result<()> {
        self.state.transition(ConnectionState::NegotiatingTls)?;

        let request = FrontendMessage::SslRequest {
            capabilities: self.capabilities,
            collation,
        };
        self.send_message(&request).await?;

        let transport = self.transport.take().ok_or(Error::ConnectionClosed)?;
        tracing::debug!(server_name = %hostname, "upgrading connection to TLS");
        self.transport = Some(transport.upgrade_to_tls(tls, hostname).await?);
        tracing::debug!("TLS connection established");
        Ok(())
    }

    /// Authentication exchange, including plugin switches and caching_sha2 full auth
    async fn authenticate(&mut self, greeting: &Handshake, config: &ConnectionConfig) -> Result<()> {
        let started = Instant::now();
        let password = config.password_str();
        let policy = config.plugin_policy;

        let mut plugin = if greeting.auth_plugin.is_empty() {
            auth_plugins::MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            greeting.auth_plugin.clone()
        };
        let mut scramble = greeting.scramble.clone();

        // A plugin we may not answer gets an empty response; the server then
        // either switches to the account's plugin or rejects the login.
        let auth_response = match policy.check(&plugin) {
            Ok(()) => password::auth_response(&plugin, password, &scramble)?,
            Err(_) => Vec::new(),
        };

        let response = HandshakeResponse {
            capabilities: self.capabilities,
            max_packet_size: MAX_PACKET_SIZE,
            collation: config.collation,
            username: config.user.clone(),
            auth_response,
            database: config.database.clone(),
            auth_plugin: plugin.clone(),
            attributes: Vec::new(),
        };
        self.send_message(&FrontendMessage::HandshakeResponse(response))
            .await?;

        let mut awaiting_public_key = false;
        loop {
            let payload = self.read_packet().await?;
            match decode_auth_reply(&payload, self.capabilities)? {
                AuthReply::Ok(_) => {
                    tracing::debug!(plugin = %plugin, "authentication successful");
                    crate::metrics::counters::auth(&plugin, labels::OUTCOME_SUCCESS);
                    crate::metrics::histograms::auth_duration(&plugin, started.elapsed());
                    return Ok(());
                }
                AuthReply::Err(err) => {
                    crate::metrics::counters::auth(&plugin, labels::OUTCOME_ERROR);
                    return Err(Error::Server(err));
                }
                AuthReply::Switch(switch) => {
                    tracing::debug!(from = %plugin, to = %switch.plugin, "auth switch requested");
                    policy.check(&switch.plugin)?;
                    plugin = switch.plugin;
                    scramble = switch.data;
                    awaiting_public_key = false;
                    let data = password::auth_response(&plugin, password, &scramble)?;
                    self.send_message(&FrontendMessage::AuthData(data)).await?;
                }
                AuthReply::MoreData(data) if plugin == auth_plugins::CACHING_SHA2_PASSWORD => {
                    if awaiting_public_key {
                        let encrypted = password::encrypt_password(password, &scramble, &data)?;
                        awaiting_public_key = false;
                        self.send_message(&FrontendMessage::AuthData(encrypted))
                            .await?;
                        continue;
                    }
                    match data.as_slice() {
                        [caching_sha2::FAST_AUTH_SUCCESS] => {
                            tracing::debug!("caching_sha2_password fast auth succeeded");
                        }
                        [caching_sha2::PERFORM_FULL_AUTH] => {
                            let secure = self.transport.as_ref().is_some_and(|t| t.is_secure());
                            if secure {
                                tracing::debug!("caching_sha2_password full auth over secure channel");
                                self.send_message(&FrontendMessage::AuthData(password::cleartext(
                                    password,
                                )))
                                .await?;
                            } else {
                                tracing::debug!("requesting server public key for full auth");
                                awaiting_public_key = true;
                                self.send_message(&FrontendMessage::AuthData(vec![
                                    caching_sha2::REQUEST_PUBLIC_KEY,
                                ]))
                                .await?;
                            }
                        }
                        other => {
                            return Err(Error::Protocol(format!(
                                "unexpected caching_sha2_password status {:?}",
                                other
                            )));
                        }
                    }
                }
                AuthReply::MoreData(_) => {
                    return Err(Error::Protocol(format!(
                        "unexpected auth continuation for plugin {}",
                        plugin
                    )));
                }
            }
        }
    }

    /// Run a statement and collect its text result set
    ///
    /// Statements that return no rows yield an empty [`ResultSet`].
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        match self.run_query(sql).await? {
            QueryOutcome::Rows(rows) => Ok(rows),
            QueryOutcome::Ok(_) => Ok(ResultSet::default()),
        }
    }

    /// Run a statement and return its OK packet
    ///
    /// Rows returned by the statement are read and discarded.
    pub async fn execute(&mut self, sql: &str) -> Result<OkPacket> {
        match self.run_query(sql).await? {
            QueryOutcome::Ok(ok) => Ok(ok),
            QueryOutcome::Rows(_) => Ok(OkPacket::default()),
        }
    }

    /// COM_PING
    pub async fn ping(&mut self) -> Result<()> {
        let result = async {
            let payload = self.start_command(Command::Ping).await?;
            match payload.first() {
                Some(&markers::OK) => Ok(()),
                Some(&markers::ERR) => Err(Error::Server(decode_err(&payload)?)),
                _ => Err(Error::Protocol("unexpected reply to COM_PING".into())),
            }
        }
        .await;
        self.finish_command(result)
    }

    async fn run_query(&mut self, sql: &str) -> Result<QueryOutcome> {
        let result = async {
            let first = self.start_command(Command::Query(sql.to_string())).await?;
            self.read_query_outcome(first).await
        }
        .instrument(tracing::debug_span!("query"))
        .await;
        self.finish_command(result)
    }

    async fn read_query_outcome(&mut self, first: Bytes) -> Result<QueryOutcome> {
        let mut outcome = None;
        let mut payload = first;

        loop {
            let status_flags = match decode_query_reply(&payload, self.capabilities)? {
                QueryReply::Ok(ok) => {
                    let flags = ok.status_flags;
                    outcome.get_or_insert(QueryOutcome::Ok(ok));
                    flags
                }
                QueryReply::Err(err) => return Err(Error::Server(err)),
                QueryReply::LocalInfile(file) => {
                    // Decline with an empty packet and surface the refusal
                    self.send_message(&FrontendMessage::AuthData(Vec::new()))
                        .await?;
                    let _ = self.read_packet().await?;
                    return Err(Error::Protocol(format!(
                        "server requested local file {:?}; LOCAL INFILE is not supported",
                        file
                    )));
                }
                QueryReply::ResultSet { column_count } => {
                    let (rows, flags) = self.read_result_set(column_count).await?;
                    outcome.get_or_insert(QueryOutcome::Rows(rows));
                    flags
                }
            };

            if status_flags & status::SERVER_MORE_RESULTS_EXISTS == 0 {
                break;
            }
            payload = self.read_packet().await?;
        }

        outcome.ok_or_else(|| Error::Protocol("query produced no reply".into()))
    }

    async fn read_result_set(&mut self, column_count: u64) -> Result<(ResultSet, u16)> {
        if column_count == 0 || column_count > MAX_COLUMNS {
            return Err(Error::Protocol(format!(
                "invalid result set column count {}",
                column_count
            )));
        }

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let payload = self.read_packet().await?;
            columns.push(decode_column_definition(&payload)?);
        }

        if self.capabilities & CLIENT_DEPRECATE_EOF == 0 {
            let payload = self.read_packet().await?;
            if !is_terminator(&payload, self.capabilities) {
                return Err(Error::Protocol(
                    "expected EOF after column definitions".into(),
                ));
            }
        }

        let mut rows = Vec::new();
        loop {
            let payload = self.read_packet().await?;
            if payload.first() == Some(&markers::ERR) {
                return Err(Error::Server(decode_err(&payload)?));
            }
            if is_terminator(&payload, self.capabilities) {
                let flags = decode_terminator_status(&payload, self.capabilities)?;
                return Ok((ResultSet { columns, rows }, flags));
            }
            rows.push(decode_text_row(&payload, columns.len())?);
        }
    }

    async fn start_command(&mut self, command: Command) -> Result<Bytes> {
        if self.state != ConnectionState::Idle {
            return Err(Error::InvalidState {
                expected: ConnectionState::Idle.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.state.transition(ConnectionState::QueryInProgress)?;
        self.sequence = 0;
        self.send_message(&FrontendMessage::Command(command)).await?;
        self.read_packet().await
    }

    /// Return to idle after a complete reply; anything else leaves the session unusable
    fn finish_command<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) | Err(Error::Server(_)) if self.state == ConnectionState::QueryInProgress => {
                self.state.transition(ConnectionState::Idle)?;
            }
            Err(Error::InvalidState { .. }) => {}
            Ok(_) | Err(Error::Server(_)) => {}
            Err(_) => self.state = ConnectionState::Closed,
        }
        result
    }

    /// Send a frontend message as one or more packets
    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let payload = encode_message(msg)
            .map_err(|e| Error::Config(format!("cannot encode packet: {}", e)))?;
        let mut out = BytesMut::with_capacity(payload.len() + 4);
        self.sequence = frame_packet(&mut out, self.sequence, &payload);

        let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
        transport.write_all(&out).await?;
        transport.flush().await?;
        Ok(())
    }

    /// Receive one logical payload, reassembling split packets
    async fn read_packet(&mut self) -> Result<Bytes> {
        let first = self.read_frame().await?;
        if !is_continued(first.payload.len()) {
            return Ok(first.payload);
        }

        let mut payload = BytesMut::from(&first.payload[..]);
        loop {
            let next = self.read_frame().await?;
            payload.extend_from_slice(&next.payload);
            check_reassembled_len(payload.len())?;
            if !is_continued(next.payload.len()) {
                return Ok(payload.freeze());
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Packet> {
        loop {
            match decode_packet(&self.read_buf) {
                Ok((packet, consumed)) => {
                    self.read_buf.advance(consumed);
                    if packet.sequence != self.sequence {
                        return Err(Error::Protocol(format!(
                            "packet out of order: expected sequence {}, got {}",
                            self.sequence, packet.sequence
                        )));
                    }
                    self.sequence = self.sequence.wrapping_add(1);
                    return Ok(packet);
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e.into()),
            }

            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            let n = transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Idle {
            self.sequence = 0;
            let _ = self.send_message(&FrontendMessage::Command(Command::Quit)).await;
        }
        self.state.transition(ConnectionState::Closed)?;
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown().await?;
        }
        Ok(())
    }
}

enum QueryOutcome {
    Ok(OkPacket),
    Rows(ResultSet),
}

/// Client capabilities for this server, failing when TLS is requested but not offered
fn negotiate_capabilities(greeting: &Handshake, config: &ConnectionConfig) -> Result<u32> {
    if greeting.capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::Protocol(format!(
            "server {} does not support protocol 4.1",
            greeting.server_version
        )));
    }

    let mut caps = CLIENT_CAPABILITIES & greeting.capabilities;
    if config.database.as_deref().is_some_and(|db| !db.is_empty()) {
        caps |= CLIENT_CONNECT_WITH_DB & greeting.capabilities;
    }
    if config.tls.is_some() {
        if greeting.capabilities & CLIENT_SSL == 0 {
            return Err(Error::Config(format!(
                "TLS requested but server {} does not support it",
                greeting.server_version
            )));
        }
        caps |= CLIENT_SSL;
    }
    Ok(caps)
}
