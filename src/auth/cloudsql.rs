//! Cloud SQL connector
//!
//! Instead of a password, the `cloudsql://` path yields a dialer. Each dial
//! fetches the instance's connect settings, obtains an ephemeral client
//! certificate for a locally generated RSA key, and opens an mTLS stream to the
//! server-side proxy on port 3307. MySQL then runs its own handshake inside
//! that stream without a second TLS layer.

use crate::config::{Configuration, Endpoint};
use crate::connection::{crypto_provider, server_name, Transport};
use crate::net::Dialer;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

const PROVIDER: &str = "gcp";

/// Public Cloud SQL Admin API
pub const DEFAULT_SQLADMIN_ENDPOINT: &str = "https://sqladmin.googleapis.com";

/// Port of the server-side Cloud SQL proxy
pub const SERVER_PROXY_PORT: u16 = 3307;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

const RSA_KEY_BITS: usize = 2048;

/// `project:region:instance` (the project may itself be `domain:project`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceName {
    /// Project id, including a legacy domain prefix
    pub project: String,
    /// Region
    pub region: String,
    /// Instance id
    pub name: String,
}

impl InstanceName {
    /// Parse an instance connection name
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.rsplitn(3, ':');
        let name = parts.next().unwrap_or_default();
        let region = parts.next().unwrap_or_default();
        let project = parts.next().unwrap_or_default();
        if project.is_empty() || region.is_empty() || name.is_empty() {
            return Err(Error::Config(format!(
                "invalid Cloud SQL instance connection name {:?}, expected project:region:instance",
                value
            )));
        }
        Ok(Self {
            project: project.to_string(),
            region: region.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSettingsResponse {
    server_ca_cert: Option<SslCert>,
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
    region: Option<String>,
    database_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SslCert {
    cert: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type")]
    kind: String,
    ip_address: String,
}

#[derive(Debug, Serialize)]
struct EphemeralCertRequest<'a> {
    public_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralCertResponse {
    ephemeral_cert: SslCert,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

/// Connection settings of one instance
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Server CA certificate (PEM)
    pub server_ca_cert: String,
    /// Public (`PRIMARY`) address
    pub public_ip: Option<IpAddr>,
    /// Private (`PRIVATE`) address
    pub private_ip: Option<IpAddr>,
    /// Reported database version, e.g. `MYSQL_8_0`
    pub database_version: String,
}

impl ConnectSettings {
    /// Address to dial
    pub fn address(&self, private_ip: bool) -> Result<IpAddr> {
        let (ip, kind) = if private_ip {
            (self.private_ip, "private")
        } else {
            (self.public_ip, "public")
        };
        ip.ok_or_else(|| Error::Config(format!("instance does not have a {} IP address", kind)))
    }
}

/// Client for the Cloud SQL Admin API
#[derive(Debug, Clone)]
pub struct AdminClient {
    http_client: Client,
    base_url: String,
}

impl AdminClient {
    /// Client for `base_url` (no trailing slash needed)
    pub fn new(base_url: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn instance_url(&self, instance: &InstanceName) -> String {
        format!(
            "{}/sql/v1beta4/projects/{}/instances/{}",
            self.base_url,
            urlencoding::encode(&instance.project),
            urlencoding::encode(&instance.name)
        )
    }

    /// Fetch the server CA and IP addresses
    pub async fn connect_settings(
        &self,
        instance: &InstanceName,
        token: &str,
    ) -> Result<ConnectSettings> {
        let response = self
            .http_client
            .get(format!("{}/connectSettings", self.instance_url(instance)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        let settings: ConnectSettingsResponse = read_json(response).await?;

        if let Some(region) = settings.region.as_deref() {
            if region != instance.region {
                return Err(Error::Config(format!(
                    "instance {} is in region {}, not {}",
                    instance, region, instance.region
                )));
            }
        }

        let database_version = settings.database_version.unwrap_or_default();
        if !database_version.is_empty() && !database_version.starts_with("MYSQL") {
            return Err(Error::Config(format!(
                "instance {} runs {}, not MySQL",
                instance, database_version
            )));
        }

        let server_ca_cert = settings
            .server_ca_cert
            .map(|c| c.cert)
            .ok_or_else(|| Error::Protocol("connect settings carry no server CA certificate".into()))?;

        let pick = |kind: &str| {
            settings
                .ip_addresses
                .iter()
                .find(|ip| ip.kind == kind)
                .and_then(|ip| ip.ip_address.parse::<IpAddr>().ok())
        };

        Ok(ConnectSettings {
            server_ca_cert,
            public_ip: pick("PRIMARY"),
            private_ip: pick("PRIVATE"),
            database_version,
        })
    }

    /// Have the API sign `public_key_pem`; the token is embedded when IAM login is used
    pub async fn ephemeral_cert(
        &self,
        instance: &InstanceName,
        token: &str,
        public_key_pem: &str,
        iam_token: Option<&str>,
    ) -> Result<String> {
        let response = self
            .http_client
            .post(format!("{}:generateEphemeralCert", self.instance_url(instance)))
            .bearer_auth(token)
            .json(&EphemeralCertRequest {
                public_key: public_key_pem,
                access_token: iam_token,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let cert: EphemeralCertResponse = read_json(response).await?;
        Ok(cert.ephemeral_cert.cert)
    }
}

/// Connector dialing one Cloud SQL instance
pub struct CloudSqlConnector {
    instance: InstanceName,
    admin: AdminClient,
    token: String,
    iam: bool,
    private_ip: bool,
    key: OnceCell<Arc<RsaPrivateKey>>,
}

impl fmt::Debug for CloudSqlConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSqlConnector")
            .field("instance", &self.instance)
            .field("admin", &self.admin)
            .field("iam", &self.iam)
            .field("private_ip", &self.private_ip)
            .finish_non_exhaustive()
    }
}

impl CloudSqlConnector {
    /// Build a connector from the configuration, resolving an API token
    pub async fn from_config(config: &Configuration) -> Result<Self> {
        let instance = match config.endpoint()? {
            Endpoint::CloudSql { instance } => InstanceName::parse(&instance)?,
            other => {
                return Err(Error::Config(format!(
                    "{} is not a cloudsql:// endpoint",
                    other
                )))
            }
        };

        let token = access_token(config.access_token.as_deref(), config.uses_gcp_iam()).await?;
        let admin = AdminClient::new(
            config
                .gcp_sqladmin_endpoint
                .as_deref()
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_SQLADMIN_ENDPOINT),
        );

        Ok(Self::new(instance, admin, token, config.uses_gcp_iam(), config.private_ip))
    }

    /// Connector with an already resolved token
    pub fn new(
        instance: InstanceName,
        admin: AdminClient,
        token: String,
        iam: bool,
        private_ip: bool,
    ) -> Self {
        Self {
            instance,
            admin,
            token,
            iam,
            private_ip,
            key: OnceCell::new(),
        }
    }

    /// Instance this connector dials
    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// Password for the MySQL login: the access token with IAM, otherwise the static one
    pub fn login_password(&self, static_password: Option<&str>) -> String {
        if self.iam {
            self.token.clone()
        } else {
            static_password.unwrap_or_default().to_string()
        }
    }

    async fn key(&self) -> Result<Arc<RsaPrivateKey>> {
        self.key
            .get_or_try_init(|| async {
                tokio::task::spawn_blocking(|| {
                    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
                })
                .await
                .map_err(|e| Error::auth(PROVIDER, format!("key generation aborted: {}", e)))?
                .map(Arc::new)
                .map_err(|e| Error::auth(PROVIDER, format!("key generation failed: {}", e)))
            })
            .await
            .cloned()
    }

    async fn client_config(&self, settings: &ConnectSettings) -> Result<Arc<ClientConfig>> {
        let key = self.key().await?;
        let public_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::auth(PROVIDER, format!("cannot encode public key: {}", e)))?;
        let private_der = key
            .to_pkcs8_der()
            .map_err(|e| Error::auth(PROVIDER, format!("cannot encode private key: {}", e)))?;

        let iam_token = self.iam.then_some(self.token.as_str());
        let cert_pem = self
            .admin
            .ephemeral_cert(&self.instance, &self.token, &public_pem, iam_token)
            .await?;

        let chain = parse_certs(&cert_pem, "ephemeral certificate")?;
        let mut roots = RootCertStore::empty();
        for ca in parse_certs(&settings.server_ca_cert, "server CA certificate")? {
            roots
                .add(ca)
                .map_err(|e| Error::Protocol(format!("invalid server CA certificate: {}", e)))?;
        }

        let provider = crypto_provider();
        let verifier = InstanceVerifier {
            roots: Arc::new(roots),
            provider: provider.clone(),
        };
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_der.as_bytes().to_vec()));

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("failed to configure TLS: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(chain, key_der)
            .map_err(|e| Error::Config(format!("ephemeral certificate rejected: {}", e)))?;

        Ok(Arc::new(config))
    }
}

#[async_trait]
impl Dialer for CloudSqlConnector {
    async fn dial(&self, target: &Endpoint) -> Result<Transport> {
        if let Endpoint::CloudSql { instance } = target {
            if *instance != self.instance.to_string() {
                return Err(Error::Config(format!(
                    "connector for {} cannot dial {}",
                    self.instance, instance
                )));
            }
        }

        let settings = self.admin.connect_settings(&self.instance, &self.token).await?;
        let ip = settings.address(self.private_ip)?;
        let client_config = self.client_config(&settings).await?;

        tracing::debug!(
            instance = %self.instance,
            ip = %ip,
            private_ip = self.private_ip,
            iam = self.iam,
            "dialing Cloud SQL instance"
        );

        let stream = TcpStream::connect((ip, SERVER_PROXY_PORT)).await?;
        let _ = stream.set_nodelay(true);

        let connector = tokio_rustls::TlsConnector::from(client_config);
        let tls = connector
            .connect(server_name(&ip.to_string())?, stream)
            .await
            .map_err(|e| Error::Tls(format!("TLS handshake with {} failed: {}", self.instance, e)))?;

        Ok(Transport::from_tls(tls))
    }

    fn name(&self) -> &'static str {
        "cloudsql"
    }
}

/// API access token: explicit token, then the GCE metadata server, then gcloud
pub async fn access_token(explicit: Option<&str>, iam: bool) -> Result<String> {
    if let Some(token) = explicit.filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    if iam {
        return Err(Error::Config(
            "iam_database_authentication requires access_token".into(),
        ));
    }

    let metadata = metadata_token(METADATA_TOKEN_URL).await;
    let metadata_err = match metadata {
        Ok(token) => return Ok(token),
        Err(e) => e,
    };

    gcloud_token().await.map_err(|e| {
        Error::auth(
            PROVIDER,
            format!("no access token available (metadata server: {}; {})", metadata_err, e),
        )
    })
}

/// Token of the default service account from the metadata server
pub async fn metadata_token(url: &str) -> Result<String> {
    let response = Client::new()
        .get(url)
        .header("Metadata-Flavor", "Google")
        .timeout(METADATA_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::auth(PROVIDER, format!("metadata server unreachable: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::auth(
            PROVIDER,
            format!("metadata server returned {}", response.status().as_u16()),
        ));
    }
    let token: MetadataToken = response
        .json()
        .await
        .map_err(|e| Error::auth(PROVIDER, format!("malformed metadata token: {}", e)))?;
    Ok(token.access_token)
}

async fn gcloud_token() -> Result<String> {
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| Error::auth(PROVIDER, format!("cannot run gcloud: {}", e)))?;
    if !output.status.success() {
        return Err(Error::auth(
            PROVIDER,
            format!("gcloud: {}", String::from_utf8_lossy(&output.stderr).trim()),
        ));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(Error::auth(PROVIDER, "gcloud printed an empty token"));
    }
    Ok(token)
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        let message = serde_json::from_str::<GoogleErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        return Err(Error::Cloud {
            code: status.as_u16(),
            message,
        });
    }
    serde_json::from_str(&body)
        .map_err(|e| Error::Protocol(format!("unexpected Cloud SQL Admin API response: {}", e)))
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Cloud SQL Admin API request failed: {}", e),
    ))
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Protocol(format!("malformed {}: {}", what, e)))?;
    if certs.is_empty() {
        return Err(Error::Protocol(format!("no {} in API response", what)));
    }
    Ok(certs)
}

/// Verifies the chain against the instance CA; the certificate names the
/// instance rather than a host, so the server name is not checked.
#[derive(Debug)]
struct InstanceVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InstanceVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
