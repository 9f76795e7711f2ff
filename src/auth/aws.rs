//! AWS RDS IAM authentication
//!
//! Loads base credentials (static keys, named profile, or the default chain),
//! optionally assumes a role through STS, and signs an RDS auth token for the
//! target `host:port` and database user. The token is used as a cleartext
//! password and is valid for 15 minutes.

use crate::config::{AwsConfig, Endpoint};
use crate::{Error, Result};
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_rds::auth_token::{AuthTokenGenerator, Config as AuthTokenConfig};
use aws_sdk_rds::config::Credentials;

const PROVIDER: &str = "aws";

/// STS session name used when assuming `role_arn`
pub const ASSUME_ROLE_SESSION_NAME: &str = "mysql-broker";

/// Sign an RDS IAM auth token for `username` at `endpoint`
pub async fn generate_auth_token(
    aws: &AwsConfig,
    endpoint: &Endpoint,
    username: &str,
) -> Result<String> {
    let (host, port) = match endpoint {
        Endpoint::Tcp { host, port } => (host.as_str(), *port),
        other => {
            return Err(Error::Config(format!(
                "AWS RDS IAM authentication needs a TCP endpoint, got {}",
                other
            )))
        }
    };

    let sdk_config = load_sdk_config(aws).await?;
    let region = sdk_config
        .region()
        .cloned()
        .ok_or_else(|| Error::auth(PROVIDER, "no AWS region configured or discoverable"))?;

    let token_config = AuthTokenConfig::builder()
        .hostname(host)
        .port(port as u64)
        .username(username)
        .region(region)
        .build()
        .map_err(|e| Error::auth(PROVIDER, format!("invalid auth token request: {}", e)))?;

    let token = AuthTokenGenerator::new(token_config)
        .auth_token(&sdk_config)
        .await
        .map_err(|e| Error::auth(PROVIDER, format!("failed to sign RDS auth token: {}", e)))?;

    tracing::debug!(host = %host, port, user = %username, "signed RDS IAM auth token");
    Ok(token.as_str().to_string())
}

/// Base SDK configuration, wrapped with an STS AssumeRole provider when `role_arn` is set
pub async fn load_sdk_config(aws: &AwsConfig) -> Result<SdkConfig> {
    let base = base_loader(aws).load().await;

    let Some(role_arn) = aws.role_arn.as_deref().filter(|r| !r.is_empty()) else {
        return Ok(base);
    };

    let region = base.region().cloned();
    let mut assume_role = AssumeRoleProvider::builder(role_arn)
        .session_name(ASSUME_ROLE_SESSION_NAME)
        .configure(&base);
    if let Some(region) = &region {
        assume_role = assume_role.region(region.clone());
    }
    let provider = assume_role.build().await;

    tracing::debug!(role_arn = %role_arn, "assuming AWS role for RDS IAM auth");

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).credentials_provider(provider);
    if let Some(region) = region {
        loader = loader.region(region);
    }
    Ok(loader.load().await)
}

fn base_loader(aws: &AwsConfig) -> aws_config::ConfigLoader {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = non_empty(&aws.region) {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(profile) = non_empty(&aws.profile) {
        loader = loader.profile_name(profile);
    }
    if let (Some(access_key), Some(secret_key)) = (non_empty(&aws.access_key), non_empty(&aws.secret_key)) {
        let creds = Credentials::new(access_key, secret_key, None, None, "mysql-broker-static");
        loader = loader.credentials_provider(creds);
    }

    loader
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
