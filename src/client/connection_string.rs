//! Connection option assembly
//!
//! Combines a [`Configuration`], the resolved [`Credential`], the selected
//! [`DialSpec`] and the TLS context into the options the protocol layer logs
//! in with. The options render as a DSN in the familiar
//! `user:password@net(address)/?params` shape, always with the password masked:
//!
//! ```text
//! admin:***@tcp(db.internal:3306)/?allowCleartextPasswords=true&tls=custom&sql_log_bin=0
//! ```

use crate::auth::password::PluginPolicy;
use crate::auth::Credential;
use crate::config::Configuration;
use crate::connection::{ConnectionConfig, TlsConfig, TlsMode};
use crate::net::{DialSpec, NetworkKind};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Parameter mapped onto the login deadline instead of a session variable
const TIMEOUT_PARAM: &str = "timeout";

/// Assembled connect options
#[derive(Clone)]
pub struct ConnectOptions {
    /// How the server is reached
    pub network: NetworkKind,
    /// `host:port`, socket path, or instance name
    pub address: String,
    /// Account name
    pub user: String,
    /// Password or token sent during login
    pub password: String,
    /// Requested TLS mode
    pub tls_mode: TlsMode,
    /// TLS context applied at the MySQL layer
    pub tls: Option<TlsConfig>,
    /// Name checked against the server certificate
    pub tls_server_name: Option<String>,
    /// Auth plugins the client may answer
    pub plugin_policy: PluginPolicy,
    /// Session variables, sorted by name
    pub params: BTreeMap<String, String>,
    /// Login deadline from the `timeout` parameter
    pub connect_timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Assemble options for one connect
    pub fn assemble(
        config: &Configuration,
        credential: &Credential,
        spec: &DialSpec,
        tls: Option<TlsConfig>,
    ) -> Result<Self> {
        let tls_mode = config.tls_mode()?;

        // TLS is negotiated in-protocol only over TCP; sockets are local and the
        // Cloud SQL connector already wraps the stream in mTLS
        let tls = match spec.kind {
            NetworkKind::Tcp | NetworkKind::Proxied => tls,
            NetworkKind::Unix | NetworkKind::CloudSql => {
                if tls_mode.is_enabled() {
                    tracing::debug!(network = %spec.kind, tls = %tls_mode, "TLS setting ignored for this network");
                }
                None
            }
        };
        let tls_server_name = tls
            .as_ref()
            .and_then(|_| spec.target.host().map(str::to_string));

        let mut params = BTreeMap::new();
        let mut connect_timeout = None;
        for (name, value) in &config.conn_params {
            if name == TIMEOUT_PARAM {
                connect_timeout = Some(parse_duration(value)?);
                continue;
            }
            validate_param(name, value)?;
            params.insert(name.clone(), value.clone());
        }

        Ok(Self {
            network: spec.kind,
            address: spec.target.address(),
            user: config.username.clone(),
            password: credential.password().to_string(),
            tls_mode,
            tls,
            tls_server_name,
            plugin_policy: PluginPolicy {
                allow_cleartext: config.allow_cleartext(),
                allow_native: config.allow_native(),
            },
            params,
            connect_timeout,
        })
    }

    /// Protocol-level login configuration
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let mut builder = ConnectionConfig::builder(&self.user)
            .password(&self.password)
            .plugin_policy(self.plugin_policy);

        if let (Some(tls), Some(name)) = (&self.tls, &self.tls_server_name) {
            builder = builder.tls(tls.clone(), name);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        for (name, value) in &self.params {
            builder = builder.session_variable(name, value);
        }

        builder.build()
    }

    /// DSN with the password masked
    pub fn dsn(&self) -> String {
        self.to_string()
    }

    fn network_name(&self) -> &'static str {
        match self.network {
            NetworkKind::Unix => "unix",
            NetworkKind::CloudSql => "cloudsql",
            NetworkKind::Tcp | NetworkKind::Proxied => "tcp",
        }
    }
}

impl fmt::Display for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        if !self.password.is_empty() {
            f.write_str(":***")?;
        }
        write!(f, "@{}({})/", self.network_name(), self.address)?;

        let mut query = Vec::new();
        if self.plugin_policy.allow_cleartext {
            query.push("allowCleartextPasswords=true".to_string());
        }
        if !self.plugin_policy.allow_native {
            query.push("allowNativePasswords=false".to_string());
        }
        if self.tls.is_some() {
            query.push(format!("tls={}", self.tls_mode));
        }
        if let Some(timeout) = self.connect_timeout {
            query.push(format!("timeout={:?}", timeout));
        }
        for (name, value) in &self.params {
            query.push(format!("{}={}", name, urlencoding::encode(value)));
        }

        if !query.is_empty() {
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectOptions").field(&self.dsn()).finish()
    }
}

/// Session variable names must be plain identifiers; values may not chain statements
fn validate_param(name: &str, value: &str) -> Result<()> {
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@' || c == '.')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid_name {
        return Err(Error::Config(format!(
            "connection parameter name {:?} is not a valid variable name",
            name
        )));
    }
    if value.is_empty() || value.contains([';', '\n', '\r', '\0']) {
        return Err(Error::Config(format!(
            "connection parameter {} has an invalid value",
            name
        )));
    }
    Ok(())
}

/// Parse `30s`, `500ms`, `2m`, `1h`, or a bare number of seconds
fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || Error::Config(format!("invalid timeout {:?}", value));

    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let seconds = match unit {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(invalid()),
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(seconds))
}
