//! TLS configuration and the named TLS registry
//!
//! A connection refers to its TLS context by [`TlsMode`]. The built-in modes
//! (`true`, `skip-verify`) are built on demand; custom bundles of CA and client
//! certificate material are built once and registered under a key so later
//! connection assembly can refer to them by name.

use crate::config::CustomTls;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::Arc;
use tokio::sync::RwLock;

/// TLS mode of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TlsMode {
    /// No TLS (`false`)
    #[default]
    Disabled,
    /// TLS with certificate and hostname verification against system roots (`true`)
    Verify,
    /// TLS without any verification (`skip-verify`)
    SkipVerify,
    /// TLS using the registered custom bundle with this key
    Custom(String),
}

impl TlsMode {
    /// Parse the `tls` setting
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" | "false" => Ok(TlsMode::Disabled),
            "true" => Ok(TlsMode::Verify),
            "skip-verify" => Ok(TlsMode::SkipVerify),
            other => Err(Error::Config(format!(
                "invalid tls '{}': expected true, false, skip-verify, or a custom_tls config_key",
                other
            ))),
        }
    }

    /// Whether TLS is requested at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsMode::Disabled)
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::Disabled => write!(f, "false"),
            TlsMode::Verify => write!(f, "true"),
            TlsMode::SkipVerify => write!(f, "skip-verify"),
            TlsMode::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for TlsMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Crypto provider used for every TLS context built by this crate
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// TLS configuration for MySQL connections.
///
/// # Examples
///
/// ```ignore
/// use mysql_broker::connection::TlsConfig;
///
/// // System roots
/// let tls = TlsConfig::builder().build()?;
///
/// // Custom CA (inline PEM or path) with a client certificate
/// let tls = TlsConfig::builder()
///     .ca_cert("/etc/mysql/ca.pem")
///     .client_identity("/etc/mysql/client.pem", "/etc/mysql/client-key.pem")
///     .build()?;
/// ```
#[derive(Clone)]
pub struct TlsConfig {
    /// Where the roots came from, for logs
    roots: String,
    /// Whether a client certificate is presented
    client_identity: bool,
    /// Whether server verification is disabled
    danger_accept_invalid_certs: bool,
    /// Compiled rustls ClientConfig
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Build a configuration from a custom TLS bundle.
    pub fn from_custom(bundle: &CustomTls) -> Result<Self> {
        let mut builder = Self::builder();
        // No CA keeps the system roots
        if !bundle.ca_cert.is_empty() {
            builder = builder.ca_cert(bundle.ca_cert.clone());
        }
        match (bundle.client_cert.as_deref(), bundle.client_key.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => {
                builder = builder.client_identity(cert, key);
            }
            _ => {}
        }
        builder.build()
    }

    /// Wrap an already compiled rustls configuration.
    pub fn from_client_config(client_config: Arc<ClientConfig>, description: &str) -> Self {
        Self {
            roots: description.to_string(),
            client_identity: client_config.client_auth_cert_resolver.has_certs(),
            danger_accept_invalid_certs: false,
            client_config,
        }
    }

    /// Get the rustls ClientConfig for this TLS configuration.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Whether a client certificate is presented.
    pub fn has_client_identity(&self) -> bool {
        self.client_identity
    }

    /// Check if invalid certificates are accepted.
    pub fn danger_accept_invalid_certs(&self) -> bool {
        self.danger_accept_invalid_certs
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("roots", &self.roots)
            .field("client_identity", &self.client_identity)
            .field(
                "danger_accept_invalid_certs",
                &self.danger_accept_invalid_certs,
            )
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for TLS configuration.
#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_cert: Option<String>,
    client_cert: Option<String>,
    client_key: Option<String>,
    danger_accept_invalid_certs: bool,
}

impl TlsConfigBuilder {
    /// CA certificate(s) as inline PEM or a path to a PEM file.
    ///
    /// If not set, system root certificates are used.
    pub fn ca_cert(mut self, pem_or_path: impl Into<String>) -> Self {
        self.ca_cert = Some(pem_or_path.into());
        self
    }

    /// Client certificate chain and private key (inline PEM or paths).
    pub fn client_identity(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    /// Accept any server certificate (`skip-verify`).
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Build the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if:
    /// - a certificate or key file cannot be read
    /// - PEM material is malformed or contains no certificate / key
    /// - the client certificate does not match the client key
    pub fn build(self) -> Result<TlsConfig> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS protocol versions: {}", e)))?;

        let (builder, roots) = if self.danger_accept_invalid_certs {
            let verifier = Arc::new(NoVerification(provider.clone()));
            (
                builder.dangerous().with_custom_certificate_verifier(verifier),
                "none (skip-verify)".to_string(),
            )
        } else if let Some(ca) = &self.ca_cert {
            (
                builder.with_root_certificates(load_ca(ca)?),
                describe(ca).to_string(),
            )
        } else {
            (
                builder.with_root_certificates(system_roots()),
                "system".to_string(),
            )
        };

        let client_config = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                let chain = load_cert_chain(cert)?;
                let key = load_private_key(key)?;
                check_key_pair(&provider, &chain, &key)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::Config(format!("error loading keypair: {}", e)))?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(TlsConfig {
            roots,
            client_identity: self.client_cert.is_some() && self.client_key.is_some(),
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            client_config: Arc::new(client_config),
        })
    }
}

/// Named TLS contexts shared by every connection built from one broker.
#[derive(Clone, Default)]
pub struct TlsRegistry {
    configs: Arc<RwLock<HashMap<String, TlsConfig>>>,
}

impl TlsRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a TLS context under `name`.
    pub async fn register(&self, name: impl Into<String>, config: TlsConfig) {
        let name = name.into();
        tracing::debug!(tls_config = %name, ?config, "registering TLS config");
        self.configs.write().await.insert(name, config);
    }

    /// Build a custom bundle and register it under its config key.
    pub async fn register_custom(&self, bundle: &CustomTls) -> Result<()> {
        let config = TlsConfig::from_custom(bundle)?;
        self.register(bundle.key(), config).await;
        Ok(())
    }

    /// Look up a registered context.
    pub async fn get(&self, name: &str) -> Option<TlsConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// TLS context for a mode; `None` when TLS is disabled.
    pub async fn resolve(&self, mode: &TlsMode) -> Result<Option<TlsConfig>> {
        match mode {
            TlsMode::Disabled => Ok(None),
            TlsMode::Verify => Ok(Some(TlsConfig::builder().build()?)),
            TlsMode::SkipVerify => Ok(Some(
                TlsConfig::builder()
                    .danger_accept_invalid_certs(true)
                    .build()?,
            )),
            TlsMode::Custom(name) => self
                .get(name)
                .await
                .map(Some)
                .ok_or_else(|| Error::Config(format!("TLS config '{}' is not registered", name))),
        }
    }
}

impl fmt::Debug for TlsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsRegistry").finish_non_exhaustive()
    }
}

/// Parse a hostname or IP literal into a TLS server name (SNI).
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_end_matches('.');
    if host.is_empty() || host.len() > 253 {
        return Err(Error::Config(format!("Invalid hostname for TLS: '{}'", host)));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Config(format!("Invalid hostname for TLS: '{}'", host)))
}

fn describe(pem_or_path: &str) -> &str {
    if is_inline_pem(pem_or_path) {
        "inline PEM"
    } else {
        pem_or_path
    }
}

fn is_inline_pem(value: &str) -> bool {
    value.trim_start().starts_with("-----BEGIN")
}

/// Read inline PEM or the file it names.
fn read_pem(pem_or_path: &str, what: &str) -> Result<Vec<u8>> {
    if is_inline_pem(pem_or_path) {
        return Ok(pem_or_path.as_bytes().to_vec());
    }
    fs::read(pem_or_path)
        .map_err(|e| Error::Config(format!("failed to read {} '{}': {}", what, pem_or_path, e)))
}

/// Load CA certificates into a root store.
fn load_ca(pem_or_path: &str) -> Result<RootCertStore> {
    let data = read_pem(pem_or_path, "CA certificate")?;
    let mut reader = std::io::Cursor::new(&data);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                root_store
                    .add(cert)
                    .map_err(|e| Error::Config(format!("invalid CA certificate: {}", e)))?;
                found_certs += 1;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse CA certificate from {}",
                    describe(pem_or_path)
                )));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Config(format!(
            "no valid certificates found in {}",
            describe(pem_or_path)
        )));
    }

    Ok(root_store)
}

/// System roots, falling back to the bundled Mozilla roots when none load.
fn system_roots() -> RootCertStore {
    let result = rustls_native_certs::load_native_certs();
    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(result.certs);

    if added == 0 {
        tracing::debug!(
            errors = result.errors.len(),
            "no native root certificates, using webpki roots"
        );
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    store
}

fn load_cert_chain(pem_or_path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = read_pem(pem_or_path, "client certificate")?;
    let mut reader = std::io::Cursor::new(&data);
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse client certificate: {}", e)))?;

    if chain.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            describe(pem_or_path)
        )));
    }
    Ok(chain)
}

fn load_private_key(pem_or_path: &str) -> Result<PrivateKeyDer<'static>> {
    let data = read_pem(pem_or_path, "client key")?;
    let mut reader = std::io::Cursor::new(&data);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("failed to parse client key: {}", e)))?
        .ok_or_else(|| {
            Error::Config(format!("no private key found in {}", describe(pem_or_path)))
        })
}

fn check_key_pair(
    provider: &CryptoProvider,
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<()> {
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| Error::Config(format!("unsupported client key: {}", e)))?;
    CertifiedKey::new(chain.to_vec(), signing_key)
        .keys_match()
        .map_err(|e| Error::Config(format!("client certificate does not match key: {}", e)))
}

/// Verifier for `skip-verify`: accepts any certificate, still checks handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
