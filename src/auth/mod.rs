//! Credential resolution
//!
//! A [`CredentialSource`] is chosen once per connect from the endpoint scheme
//! and provider flags, then resolved into a [`Credential`]:
//! * `Static`: the configured password
//! * `AwsIam`: an RDS IAM auth token (optionally via STS AssumeRole)
//! * `AzureAd`: an Azure AD access token for the database audience
//! * `GcpCloudSql`: a Cloud SQL connector used as the dialer
//!
//! Resolution validates the configuration first, so conflicting credential
//! sources fail before any network call.

pub mod aws;
pub mod azure;
pub mod cloudsql;
pub mod password;

use crate::config::{AzureConfig, Configuration};
use crate::metrics::{counters, labels};
use crate::net::Dialer;
use crate::Result;
use azure::AzureTokenSource;
use cloudsql::CloudSqlConnector;
use std::fmt;
use std::sync::Arc;

/// Resolved secret material for one connect
#[derive(Clone)]
pub enum Credential {
    /// Static password (possibly empty)
    Password(String),
    /// Short-lived token sent as a cleartext password
    Token {
        /// Issuing provider (`aws`, `azure`)
        provider: &'static str,
        /// The token
        token: String,
    },
    /// Driver-level dialer plus the password to log in with
    Connector {
        /// Cloud SQL connector
        dialer: Arc<CloudSqlConnector>,
        /// Access token with IAM login, otherwise the static password
        password: String,
    },
}

impl Credential {
    /// Password sent during the MySQL login
    pub fn password(&self) -> &str {
        match self {
            Credential::Password(password) => password,
            Credential::Token { token, .. } => token,
            Credential::Connector { password, .. } => password,
        }
    }

    /// Dialer supplied by the credential, if it replaces the network dialer
    pub fn dialer(&self) -> Option<Arc<dyn Dialer>> {
        match self {
            Credential::Connector { dialer, .. } => Some(dialer.clone() as Arc<dyn Dialer>),
            _ => None,
        }
    }

    /// Whether the credential is a bearer token
    pub fn is_token(&self) -> bool {
        matches!(self, Credential::Token { .. })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(password) => f
                .debug_tuple("Password")
                .field(&if password.is_empty() { "<empty>" } else { "<redacted>" })
                .finish(),
            Credential::Token { provider, .. } => f
                .debug_struct("Token")
                .field("provider", provider)
                .field("token", &"<redacted>")
                .finish(),
            Credential::Connector { dialer, .. } => f
                .debug_struct("Connector")
                .field("instance", &dialer.instance().to_string())
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Where the credential comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSource {
    /// Configured password
    Static,
    /// AWS RDS IAM token
    AwsIam,
    /// Azure AD token
    AzureAd,
    /// Cloud SQL connector
    GcpCloudSql,
}

impl CredentialSource {
    /// Select the source for a configuration
    pub fn for_config(config: &Configuration) -> Self {
        if config.uses_cloudsql() {
            CredentialSource::GcpCloudSql
        } else if config.uses_azure_ad() {
            CredentialSource::AzureAd
        } else if config.uses_aws_iam() {
            CredentialSource::AwsIam
        } else {
            CredentialSource::Static
        }
    }

    /// Short name for logs, metrics and cache keys
    pub fn name(&self) -> &'static str {
        match self {
            CredentialSource::Static => "static",
            CredentialSource::AwsIam => "aws",
            CredentialSource::AzureAd => "azure",
            CredentialSource::GcpCloudSql => "gcp",
        }
    }

    /// Resolve the credential
    pub async fn resolve(&self, config: &Configuration) -> Result<Credential> {
        config.validate()?;
        tracing::debug!(source = self.name(), "resolving credential");

        let result = self.resolve_validated(config).await;
        let outcome = if result.is_ok() {
            labels::OUTCOME_SUCCESS
        } else {
            labels::OUTCOME_ERROR
        };
        counters::credential_resolution(self.name(), outcome);
        result
    }

    async fn resolve_validated(&self, config: &Configuration) -> Result<Credential> {
        match self {
            CredentialSource::Static => Ok(Credential::Password(
                config.password.clone().unwrap_or_default(),
            )),
            CredentialSource::AwsIam => {
                let aws_config = config.aws_config.clone().unwrap_or_default();
                let token =
                    aws::generate_auth_token(&aws_config, &config.endpoint()?, &config.username)
                        .await?;
                Ok(Credential::Token {
                    provider: "aws",
                    token,
                })
            }
            CredentialSource::AzureAd => {
                let azure_config = config.azure_config.clone().unwrap_or_else(AzureConfig::default);
                let source = AzureTokenSource::new(
                    azure_config.environment(),
                    config.azure_authority_host.as_deref(),
                );
                let token = source.fetch(&azure_config).await?;
                Ok(Credential::Token {
                    provider: "azure",
                    token,
                })
            }
            CredentialSource::GcpCloudSql => {
                let connector = CloudSqlConnector::from_config(config).await?;
                let password = connector.login_password(config.password.as_deref());
                Ok(Credential::Connector {
                    dialer: Arc::new(connector),
                    password,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AwsConfig;
    use crate::Error;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_source_selection() {
        let pick = |endpoint: &str| {
            CredentialSource::for_config(&Configuration::builder(endpoint, "u").build())
        };
        assert_eq!(pick("db:3306"), CredentialSource::Static);
        assert_eq!(pick("aws://db:3306"), CredentialSource::AwsIam);
        assert_eq!(pick("azure://srv"), CredentialSource::AzureAd);
        assert_eq!(pick("cloudsql://p:r:i"), CredentialSource::GcpCloudSql);
        assert_eq!(pick("/tmp/mysqld.sock"), CredentialSource::Static);

        let flagged = Configuration::builder("db.rds.amazonaws.com", "u")
            .aws(AwsConfig {
                aws_rds_iam_auth: true,
                ..Default::default()
            })
            .build();
        assert_eq!(CredentialSource::for_config(&flagged), CredentialSource::AwsIam);
    }

    #[tokio::test]
    async fn test_static_password() {
        let config = Configuration::builder("db:3306", "root").password("pw").build();
        let credential = CredentialSource::Static.resolve(&config).await.unwrap();
        assert_eq!(credential.password(), "pw");
        assert!(credential.dialer().is_none());
        assert!(!format!("{:?}", credential).contains("pw"));

        let empty = Configuration::builder("db:3306", "root").build();
        let credential = CredentialSource::Static.resolve(&empty).await.unwrap();
        assert_eq!(credential.password(), "");
    }

    #[tokio::test]
    async fn test_password_conflict_fails_before_network() {
        let config = Configuration::builder("aws://db.rds.amazonaws.com", "admin")
            .password("hunter2")
            .aws(AwsConfig {
                region: Some("us-east-1".into()),
                role_arn: Some("arn:aws:iam::123456789012:role/db".into()),
                ..Default::default()
            })
            .build();
        let source = CredentialSource::for_config(&config);
        let err = source.resolve(&config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let gcp = Configuration::builder("cloudsql://p:r:i", "sa@p.iam")
            .password("token")
            .iam_database_authentication(true)
            .gcp_sqladmin_endpoint("http://127.0.0.1:9")
            .build();
        let err = CredentialSource::for_config(&gcp).resolve(&gcp).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_azure_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tid/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "eyJ0eXAi"
            })))
            .mount(&server)
            .await;

        let config = Configuration::builder("azure://srv.mysql.database.azure.com", "aad_admin")
            .azure(AzureConfig {
                tenant_id: Some("tid".into()),
                client_id: Some("cid".into()),
                client_secret: Some("secret".into()),
                environment: Some("public".into()),
            })
            .azure_authority_host(server.uri())
            .build();

        let credential = CredentialSource::AzureAd.resolve(&config).await.unwrap();
        assert!(credential.is_token());
        assert_eq!(credential.password(), "eyJ0eXAi");
    }

    #[tokio::test]
    async fn test_cloudsql_iam_uses_access_token() {
        let config = Configuration::builder("cloudsql://proj:us-central1:main", "sa@proj.iam")
            .iam_database_authentication(true)
            .access_token("ya29.token")
            .build();

        let credential = CredentialSource::GcpCloudSql.resolve(&config).await.unwrap();
        assert_eq!(credential.password(), "ya29.token");
        assert_eq!(credential.dialer().unwrap().name(), "cloudsql");
    }
}
