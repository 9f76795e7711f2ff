//! Broker configuration
//!
//! A [`Configuration`] is built once (from code, JSON, or the environment) and
//! never mutated afterwards. Everything that can be checked without touching
//! the network is checked by [`Configuration::validate`].

pub mod endpoint;

pub use endpoint::{Endpoint, EndpointScheme};

use crate::connection::TlsMode;
use crate::error::{Error, Result};
use crate::net::ProxySpec;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Default retry budget for the connect loop
pub const DEFAULT_CONNECT_RETRY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default lookup key for a custom TLS bundle
pub const DEFAULT_TLS_CONFIG_KEY: &str = "custom";

/// Environment variables consulted for the proxy, in order
const PROXY_ENV_VARS: [&str; 6] = [
    "ALL_PROXY",
    "all_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
];

/// Client-side authentication plugin mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthPlugin {
    /// Allow `mysql_native_password`
    #[default]
    Native,
    /// Allow `mysql_clear_password`
    Cleartext,
}

impl AuthPlugin {
    /// Parse `native` / `cleartext` (case-insensitive)
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "native" => Ok(AuthPlugin::Native),
            "cleartext" => Ok(AuthPlugin::Cleartext),
            other => Err(Error::Config(format!(
                "authentication_plugin must be one of cleartext, native (got {:?})",
                other
            ))),
        }
    }

    /// Name used in the cache key and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthPlugin::Native => "native",
            AuthPlugin::Cleartext => "cleartext",
        }
    }
}

/// Azure cloud the AAD token is requested from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AzureEnvironment {
    /// Azure public cloud
    #[default]
    Public,
    /// Azure China (21Vianet)
    China,
    /// Azure Germany
    German,
    /// Azure US Government
    UsGovernment,
}

impl AzureEnvironment {
    /// Parse an explicitly configured environment name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(AzureEnvironment::Public),
            "china" => Some(AzureEnvironment::China),
            "german" => Some(AzureEnvironment::German),
            "usgovernment" => Some(AzureEnvironment::UsGovernment),
            _ => None,
        }
    }

    /// Map any value onto an environment; unknown and empty values are public
    pub fn from_name_or_public(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or_default()
    }

    /// Token audience of Azure Database for MySQL in this cloud
    pub fn audience(&self) -> &'static str {
        match self {
            AzureEnvironment::Public => "https://ossrdbms-aad.database.windows.net",
            AzureEnvironment::China => "https://ossrdbms-aad.database.chinacloudapi.cn",
            AzureEnvironment::German => "https://ossrdbms-aad.database.chinacloudapi.de",
            AzureEnvironment::UsGovernment => "https://ossrdbms-aad.database.usgovcloudapi.net",
        }
    }

    /// Azure AD authority host for this cloud
    pub fn authority_host(&self) -> &'static str {
        match self {
            AzureEnvironment::Public => "https://login.microsoftonline.com",
            AzureEnvironment::China => "https://login.chinacloudapi.cn",
            AzureEnvironment::German => "https://login.microsoftonline.de",
            AzureEnvironment::UsGovernment => "https://login.microsoftonline.us",
        }
    }

    /// Name used in the cache key and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AzureEnvironment::Public => "public",
            AzureEnvironment::China => "china",
            AzureEnvironment::German => "german",
            AzureEnvironment::UsGovernment => "usgovernment",
        }
    }
}

/// Custom TLS bundle; each field is inline PEM or a file path
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CustomTls {
    /// Name the TLS context is registered under
    pub config_key: String,
    /// CA certificate(s)
    pub ca_cert: String,
    /// Client certificate chain (used only together with `client_key`)
    pub client_cert: Option<String>,
    /// Client private key
    pub client_key: Option<String>,
}

impl CustomTls {
    /// Bundle with the given CA and the default config key
    pub fn new(ca_cert: impl Into<String>) -> Self {
        Self {
            config_key: DEFAULT_TLS_CONFIG_KEY.to_string(),
            ca_cert: ca_cert.into(),
            client_cert: None,
            client_key: None,
        }
    }

    /// Attach a client certificate and key
    pub fn client_identity(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    /// Register under a different name
    pub fn config_key(mut self, key: impl Into<String>) -> Self {
        self.config_key = key.into();
        self
    }

    /// Config key, falling back to the default when empty
    pub fn key(&self) -> &str {
        if self.config_key.is_empty() {
            DEFAULT_TLS_CONFIG_KEY
        } else {
            &self.config_key
        }
    }
}

impl fmt::Debug for CustomTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomTls")
            .field("config_key", &self.key())
            .field("ca_cert", &pem_or_path(&self.ca_cert))
            .field("client_cert", &self.client_cert.as_deref().map(pem_or_path))
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn pem_or_path(value: &str) -> &str {
    if value.starts_with("-----BEGIN") {
        "<inline PEM>"
    } else {
        value
    }
}

/// AWS credential block
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AwsConfig {
    /// Region used for token signing
    pub region: Option<String>,
    /// Shared config profile
    pub profile: Option<String>,
    /// Static access key id (requires `secret_key`)
    pub access_key: Option<String>,
    /// Static secret access key (requires `access_key`)
    pub secret_key: Option<String>,
    /// Role to assume through STS before signing
    pub role_arn: Option<String>,
    /// Enable RDS IAM authentication for a plain endpoint
    pub aws_rds_iam_auth: bool,
}

impl fmt::Debug for AwsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsConfig")
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("access_key", &self.access_key.as_ref().map(|_| "<set>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("role_arn", &self.role_arn)
            .field("aws_rds_iam_auth", &self.aws_rds_iam_auth)
            .finish()
    }
}

/// Azure AD credential block
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AzureConfig {
    /// Directory (tenant) id
    pub tenant_id: Option<String>,
    /// Application (client) id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<String>,
    /// One of `public`, `china`, `german`, `usgovernment`
    pub environment: Option<String>,
}

impl AzureConfig {
    /// Whether the client-secret flow can be used
    pub fn has_client_secret(&self) -> bool {
        non_empty(&self.tenant_id) && non_empty(&self.client_id) && non_empty(&self.client_secret)
    }

    /// Resolved cloud environment
    pub fn environment(&self) -> AzureEnvironment {
        AzureEnvironment::from_name_or_public(self.environment.as_deref())
    }
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("environment", &self.environment)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// Declarative broker configuration
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// `host:port`, `/path/to/socket`, or `aws://`, `azure://`, `cloudsql://` prefixed
    pub endpoint: String,
    /// Account name
    pub username: String,
    /// Static password; forbidden with IAM and AAD token authentication
    pub password: Option<String>,
    /// `socks5[h]|http|https://[user:pass@]host:port`
    pub proxy: Option<String>,
    /// `true`, `false`, `skip-verify`, or the key of `custom_tls`
    #[serde(deserialize_with = "bool_or_string")]
    pub tls: String,
    /// Custom CA / client certificate bundle
    pub custom_tls: Option<CustomTls>,
    /// Extra connection parameters, passed through to the session
    pub conn_params: HashMap<String, String>,
    /// `native` or `cleartext`
    pub authentication_plugin: String,
    /// Total budget for the retrying connect loop
    #[serde(
        rename = "connect_retry_timeout_sec",
        deserialize_with = "duration_from_secs"
    )]
    pub connect_retry_timeout: Duration,
    /// Lifetime hint for the cached connection (not enforced)
    #[serde(
        rename = "max_conn_lifetime_sec",
        deserialize_with = "optional_duration_from_secs"
    )]
    pub max_conn_lifetime: Option<Duration>,
    /// Accepted for compatibility; the effective pool size is always 1
    pub max_open_conns: Option<u32>,
    /// AWS credential block
    pub aws_config: Option<AwsConfig>,
    /// Azure AD credential block
    pub azure_config: Option<AzureConfig>,
    /// Use IAM database authentication with the Cloud SQL connector
    pub iam_database_authentication: bool,
    /// Connect to the Cloud SQL instance's private IP
    pub private_ip: bool,
    /// OAuth2 access token for the Cloud SQL connector
    pub access_token: Option<String>,
    /// Override for the Cloud SQL Admin API base URL
    pub gcp_sqladmin_endpoint: Option<String>,
    /// Override for the Azure AD authority host
    pub azure_authority_host: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: None,
            proxy: None,
            tls: "false".to_string(),
            custom_tls: None,
            conn_params: HashMap::new(),
            authentication_plugin: AuthPlugin::Native.as_str().to_string(),
            connect_retry_timeout: DEFAULT_CONNECT_RETRY_TIMEOUT,
            max_conn_lifetime: None,
            max_open_conns: None,
            aws_config: None,
            azure_config: None,
            iam_database_authentication: false,
            private_ip: false,
            access_token: None,
            gcp_sqladmin_endpoint: None,
            azure_authority_host: None,
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proxy = self
            .proxy
            .as_deref()
            .map(|p| ProxySpec::parse(p).map(|s| s.masked()).unwrap_or_else(|_| "<invalid>".into()));
        f.debug_struct("Configuration")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("proxy", &proxy)
            .field("tls", &self.tls)
            .field("custom_tls", &self.custom_tls)
            .field("conn_params", &self.conn_params)
            .field("authentication_plugin", &self.authentication_plugin)
            .field("connect_retry_timeout", &self.connect_retry_timeout)
            .field("max_conn_lifetime", &self.max_conn_lifetime)
            .field("max_open_conns", &self.max_open_conns)
            .field("aws_config", &self.aws_config)
            .field("azure_config", &self.azure_config)
            .field("iam_database_authentication", &self.iam_database_authentication)
            .field("private_ip", &self.private_ip)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Configuration {
    /// Create a builder for the given endpoint and account
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = Configuration::builder("aws://db.cluster.rds.amazonaws.com", "admin")
    ///     .aws(AwsConfig { region: Some("eu-west-1".into()), ..Default::default() })
    ///     .tls("true")
    ///     .build();
    /// ```
    pub fn builder(endpoint: impl Into<String>, username: impl Into<String>) -> ConfigurationBuilder {
        ConfigurationBuilder {
            config: Configuration {
                endpoint: endpoint.into(),
                username: username.into(),
                ..Configuration::default()
            },
        }
    }

    /// Parse a JSON document with the same field names as the environment-backed schema
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
    }

    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let first = |keys: &[&str]| keys.iter().find_map(|k| get(k));

        let mut config = Configuration {
            endpoint: get("MYSQL_ENDPOINT").unwrap_or_default(),
            username: get("MYSQL_USERNAME").unwrap_or_default(),
            password: get("MYSQL_PASSWORD"),
            proxy: first(&PROXY_ENV_VARS[..]),
            tls: get("MYSQL_TLS_CONFIG").unwrap_or_else(|| "false".to_string()),
            access_token: get("GOOGLE_OAUTH_ACCESS_TOKEN"),
            azure_authority_host: get("AZURE_AUTHORITY_HOST"),
            ..Configuration::default()
        };

        let ca_cert = get("MYSQL_TLS_CA_CERT");
        let client_cert = get("MYSQL_TLS_CLIENT_CERT");
        let client_key = get("MYSQL_TLS_CLIENT_KEY");
        if ca_cert.is_some() || (client_cert.is_some() && client_key.is_some()) {
            config.custom_tls = Some(CustomTls {
                config_key: get("MYSQL_TLS_CONFIG_KEY")
                    .unwrap_or_else(|| DEFAULT_TLS_CONFIG_KEY.to_string()),
                ca_cert: ca_cert.unwrap_or_default(),
                client_cert,
                client_key,
            });
        }

        let azure = AzureConfig {
            tenant_id: first(&["AZURE_TENANT_ID", "ARM_TENANT_ID"][..]),
            client_id: first(&["AZURE_CLIENT_ID", "ARM_CLIENT_ID"][..]),
            client_secret: first(&["AZURE_CLIENT_SECRET", "ARM_CLIENT_SECRET"][..]),
            // Unrecognized environment names from the environment mean public
            environment: first(&["AZURE_ENVIRONMENT", "ARM_ENVIRONMENT"][..])
                .filter(|name| AzureEnvironment::parse(name).is_some()),
        };
        if azure != AzureConfig::default() {
            config.azure_config = Some(azure);
        }

        config
    }

    /// Check everything that can be checked without network I/O
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint must not be an empty string".into()));
        }
        if self.username.is_empty() {
            return Err(Error::Config("username must not be empty".into()));
        }

        let scheme = self.scheme();
        self.endpoint()?;

        if let Some(proxy) = self.proxy.as_deref().filter(|p| !p.is_empty()) {
            ProxySpec::parse(proxy)?;
        }

        AuthPlugin::parse(&self.authentication_plugin)?;
        self.tls_mode()?;

        if let Some(aws) = &self.aws_config {
            if non_empty(&aws.access_key) != non_empty(&aws.secret_key) {
                return Err(Error::Config(
                    "access_key and secret_key must be provided together in aws_config".into(),
                ));
            }
            if aws.aws_rds_iam_auth
                && matches!(scheme, EndpointScheme::CloudSql | EndpointScheme::Azure)
            {
                return Err(Error::Config(format!(
                    "aws_rds_iam_auth cannot be combined with a {} endpoint",
                    scheme
                )));
            }
        }

        if let Some(name) = self
            .azure_config
            .as_ref()
            .and_then(|a| a.environment.as_deref())
            .filter(|name| !name.is_empty())
        {
            if AzureEnvironment::parse(name).is_none() {
                return Err(Error::Config(format!(
                    "azure_config.environment must be one of public, china, german, usgovernment (got {:?})",
                    name
                )));
            }
        }

        if self.password.as_deref().is_some_and(|p| !p.is_empty()) {
            if self.uses_aws_iam() {
                return Err(Error::Config(
                    "password must be empty when AWS RDS IAM authentication is enabled".into(),
                ));
            }
            if self.uses_gcp_iam() {
                return Err(Error::Config(
                    "password must be empty when iam_database_authentication is enabled; use access_token".into(),
                ));
            }
            if self.uses_azure_ad() {
                return Err(Error::Config(
                    "password must be empty for azure:// endpoints".into(),
                ));
            }
        }

        Ok(())
    }

    /// Endpoint scheme prefix
    pub fn scheme(&self) -> EndpointScheme {
        EndpointScheme::of(&self.endpoint)
    }

    /// Parsed endpoint with the scheme prefix removed and the default port applied
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.endpoint)
    }

    /// AWS RDS IAM authentication: `aws://` prefix or `aws_rds_iam_auth`
    pub fn uses_aws_iam(&self) -> bool {
        if self.scheme() == EndpointScheme::Unix {
            return false;
        }
        self.scheme() == EndpointScheme::Aws
            || self.aws_config.as_ref().is_some_and(|a| a.aws_rds_iam_auth)
    }

    /// Azure AD token authentication (`azure://` prefix)
    pub fn uses_azure_ad(&self) -> bool {
        self.scheme() == EndpointScheme::Azure
    }

    /// Cloud SQL connector (`cloudsql://` prefix)
    pub fn uses_cloudsql(&self) -> bool {
        self.scheme() == EndpointScheme::CloudSql
    }

    /// Cloud SQL IAM database authentication
    pub fn uses_gcp_iam(&self) -> bool {
        self.uses_cloudsql() && self.iam_database_authentication
    }

    /// Client auth plugin mode
    pub fn auth_plugin(&self) -> Result<AuthPlugin> {
        AuthPlugin::parse(&self.authentication_plugin)
    }

    /// Whether `mysql_clear_password` may be answered
    pub fn allow_cleartext(&self) -> bool {
        self.auth_plugin().ok() == Some(AuthPlugin::Cleartext)
            || self.uses_aws_iam()
            || self.uses_azure_ad()
            || self.uses_gcp_iam()
    }

    /// Whether `mysql_native_password` may be answered
    pub fn allow_native(&self) -> bool {
        self.auth_plugin().ok() == Some(AuthPlugin::Native)
    }

    /// TLS mode; a custom bundle always wins over the `tls` string
    pub fn tls_mode(&self) -> Result<TlsMode> {
        if let Some(custom) = &self.custom_tls {
            return Ok(TlsMode::Custom(custom.key().to_string()));
        }
        TlsMode::parse(&self.tls)
    }

    /// Effective connection pool size
    pub fn effective_max_open_conns(&self) -> u32 {
        1
    }
}

/// Builder for [`Configuration`]
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    config: Configuration,
}

impl ConfigurationBuilder {
    /// Set the static password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set the proxy URL
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    /// Set the TLS mode string (`true`, `false`, `skip-verify`)
    pub fn tls(mut self, tls: impl Into<String>) -> Self {
        self.config.tls = tls.into();
        self
    }

    /// Use a custom TLS bundle
    pub fn custom_tls(mut self, bundle: CustomTls) -> Self {
        self.config.custom_tls = Some(bundle);
        self
    }

    /// Add a connection parameter
    pub fn conn_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.conn_params.insert(key.into(), value.into());
        self
    }

    /// Set the auth plugin mode (`native` or `cleartext`)
    pub fn authentication_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.config.authentication_plugin = plugin.into();
        self
    }

    /// Set the connect retry budget
    pub fn connect_retry_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_retry_timeout = timeout;
        self
    }

    /// Set the connection lifetime hint
    pub fn max_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_conn_lifetime = Some(lifetime);
        self
    }

    /// Set the requested pool size (pinned to 1)
    pub fn max_open_conns(mut self, conns: u32) -> Self {
        self.config.max_open_conns = Some(conns);
        self
    }

    /// Set the AWS credential block
    pub fn aws(mut self, aws: AwsConfig) -> Self {
        self.config.aws_config = Some(aws);
        self
    }

    /// Set the Azure credential block
    pub fn azure(mut self, azure: AzureConfig) -> Self {
        self.config.azure_config = Some(azure);
        self
    }

    /// Enable Cloud SQL IAM database authentication
    pub fn iam_database_authentication(mut self, enabled: bool) -> Self {
        self.config.iam_database_authentication = enabled;
        self
    }

    /// Prefer the Cloud SQL private IP
    pub fn private_ip(mut self, enabled: bool) -> Self {
        self.config.private_ip = enabled;
        self
    }

    /// OAuth2 access token for the Cloud SQL connector
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    /// Override the Cloud SQL Admin API base URL
    pub fn gcp_sqladmin_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.gcp_sqladmin_endpoint = Some(url.into());
        self
    }

    /// Override the Azure AD authority host
    pub fn azure_authority_host(mut self, url: impl Into<String>) -> Self {
        self.config.azure_authority_host = Some(url.into());
        self
    }

    /// Build the configuration (validation happens on connect)
    pub fn build(self) -> Configuration {
        self.config
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrString {
    Bool(bool),
    String(String),
}

fn bool_or_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => b.to_string(),
        BoolOrString::String(s) => s,
    })
}

fn duration_from_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn optional_duration_from_secs<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}
