//! Azure AD token acquisition for Azure Database for MySQL
//!
//! With tenant, client id, and client secret all present the client-secret flow
//! is used. Otherwise a default chain is tried in order: workload identity
//! (`AZURE_FEDERATED_TOKEN_FILE`), managed identity (IMDS), Azure CLI.

use crate::config::{AzureConfig, AzureEnvironment};
use crate::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const PROVIDER: &str = "azure";

/// Instance metadata token endpoint
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_TIMEOUT: Duration = Duration::from_secs(2);

/// OAuth2 token endpoint response
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    expires_in: Option<u64>,
}

/// `az account get-access-token` output
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Azure AD token source
#[derive(Debug, Clone)]
pub struct AzureTokenSource {
    http_client: Client,
    authority_host: String,
    imds_endpoint: String,
    environment: AzureEnvironment,
}

impl AzureTokenSource {
    /// Token source for the given cloud, optionally overriding the authority host
    pub fn new(environment: AzureEnvironment, authority_host: Option<&str>) -> Self {
        let authority_host = authority_host
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| environment.authority_host())
            .trim_end_matches('/')
            .to_string();
        Self {
            http_client: Client::new(),
            authority_host,
            imds_endpoint: IMDS_TOKEN_ENDPOINT.to_string(),
            environment,
        }
    }

    /// Override the managed identity endpoint
    pub fn with_imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.imds_endpoint = endpoint.into();
        self
    }

    /// OAuth2 scope for the database audience
    pub fn scope(&self) -> String {
        format!("{}/.default", self.environment.audience())
    }

    fn token_endpoint(&self, tenant: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant)
    }

    /// Fetch an access token for the configured credential
    pub async fn fetch(&self, azure: &AzureConfig) -> Result<String> {
        if azure.has_client_secret() {
            tracing::debug!("using Azure AD client secret credential");
            let tenant = azure.tenant_id.as_deref().unwrap_or_default();
            let client_id = azure.client_id.as_deref().unwrap_or_default();
            let secret = azure.client_secret.as_deref().unwrap_or_default();
            return self.client_secret(tenant, client_id, secret).await;
        }
        self.default_chain(azure).await
    }

    /// Client credentials grant
    pub async fn client_secret(&self, tenant: &str, client_id: &str, secret: &str) -> Result<String> {
        let scope = self.scope();
        let params = [
            ("client_id", client_id),
            ("client_secret", secret),
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
        ];
        self.token_request(&self.token_endpoint(tenant), &params).await
    }

    async fn default_chain(&self, azure: &AzureConfig) -> Result<String> {
        let mut failures = Vec::new();

        if let Some(token_file) = env_var("AZURE_FEDERATED_TOKEN_FILE") {
            let tenant = azure.tenant_id.clone().or_else(|| env_var("AZURE_TENANT_ID"));
            let client_id = azure.client_id.clone().or_else(|| env_var("AZURE_CLIENT_ID"));
            match (tenant, client_id) {
                (Some(tenant), Some(client_id)) => {
                    match self.workload_identity(&tenant, &client_id, &token_file).await {
                        Ok(token) => return Ok(token),
                        Err(e) => failures.push(format!("workload identity: {}", e)),
                    }
                }
                _ => failures.push("workload identity: tenant or client id missing".to_string()),
            }
        }

        match self.managed_identity(azure.client_id.as_deref()).await {
            Ok(token) => return Ok(token),
            Err(e) => failures.push(format!("managed identity: {}", e)),
        }

        match self.azure_cli(azure.tenant_id.as_deref()).await {
            Ok(token) => return Ok(token),
            Err(e) => failures.push(format!("azure cli: {}", e)),
        }

        Err(Error::auth(
            PROVIDER,
            format!(
                "failed to acquire token from the default credential chain: {}",
                failures.join("; ")
            ),
        ))
    }

    /// Federated token exchange (AKS workload identity)
    pub async fn workload_identity(
        &self,
        tenant: &str,
        client_id: &str,
        token_file: &str,
    ) -> Result<String> {
        let assertion = tokio::fs::read_to_string(token_file).await.map_err(|e| {
            Error::auth(PROVIDER, format!("cannot read federated token {}: {}", token_file, e))
        })?;
        let scope = self.scope();
        let params = [
            ("client_id", client_id),
            ("client_assertion", assertion.trim()),
            (
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
            ),
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
        ];
        self.token_request(&self.token_endpoint(tenant), &params).await
    }

    /// Managed identity through the instance metadata service
    pub async fn managed_identity(&self, client_id: Option<&str>) -> Result<String> {
        let mut query = vec![
            ("api-version", "2018-02-01"),
            ("resource", self.environment.audience()),
        ];
        if let Some(client_id) = client_id.filter(|c| !c.is_empty()) {
            query.push(("client_id", client_id));
        }

        let response = self
            .http_client
            .get(&self.imds_endpoint)
            .query(&query)
            .header("Metadata", "true")
            .timeout(IMDS_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::auth(PROVIDER, format!("IMDS unreachable: {}", e)))?;

        read_token(response).await
    }

    async fn azure_cli(&self, tenant: Option<&str>) -> Result<String> {
        let mut command = tokio::process::Command::new("az");
        command.args([
            "account",
            "get-access-token",
            "--output",
            "json",
            "--resource",
            self.environment.audience(),
        ]);
        if let Some(tenant) = tenant.filter(|t| !t.is_empty()) {
            command.args(["--tenant", tenant]);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::auth(PROVIDER, format!("cannot run az: {}", e)))?;
        if !output.status.success() {
            return Err(Error::auth(
                PROVIDER,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let parsed: CliTokenResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::auth(PROVIDER, format!("unexpected az output: {}", e)))?;
        Ok(parsed.access_token)
    }

    async fn token_request(&self, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let response = self
            .http_client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::auth(PROVIDER, format!("token request failed: {}", e)))?;

        read_token(response).await
    }
}

async fn read_token(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::auth(PROVIDER, format!("failed to read token response: {}", e)))?;

    if !status.is_success() {
        let detail = match serde_json::from_str::<OAuthErrorResponse>(&body) {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            Err(_) => body,
        };
        return Err(Error::auth(
            PROVIDER,
            format!("token endpoint returned {}: {}", status.as_u16(), detail),
        ));
    }

    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| Error::auth(PROVIDER, format!("malformed token response: {}", e)))?;
    if token.access_token.is_empty() {
        return Err(Error::auth(PROVIDER, "token response has an empty access_token"));
    }
    Ok(token.access_token)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// IMDS reports expires_in as a string, AAD as a number
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<NumOrString>::deserialize(deserializer)? {
        Some(NumOrString::Num(n)) => Some(n),
        Some(NumOrString::Str(s)) => s.parse().ok(),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_client_secret_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains(
                "scope=https%3A%2F%2Fossrdbms-aad.database.windows.net%2F.default",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "aad-token",
                "token_type": "Bearer",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = AzureTokenSource::new(AzureEnvironment::Public, Some(&server.uri()));
        let token = source
            .fetch(&AzureConfig {
                tenant_id: Some("tenant-1".into()),
                client_id: Some("app".into()),
                client_secret: Some("secret".into()),
                environment: None,
            })
            .await
            .unwrap();
        assert_eq!(token, "aad-token");
    }

    #[tokio::test]
    async fn test_token_error_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided."
            })))
            .mount(&server)
            .await;

        let source = AzureTokenSource::new(AzureEnvironment::China, Some(&server.uri()));
        let err = source.client_secret("t", "c", "bad").await.unwrap_err();
        assert!(matches!(err, Error::Auth { provider: "azure", .. }));
        assert!(err.to_string().contains("AADSTS7000215"));
    }

    #[tokio::test]
    async fn test_managed_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("Metadata", "true"))
            .and(query_param(
                "resource",
                "https://ossrdbms-aad.database.usgovcloudapi.net",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "imds-token",
                "expires_in": "86399",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let source = AzureTokenSource::new(AzureEnvironment::UsGovernment, None)
            .with_imds_endpoint(format!("{}/metadata/identity/oauth2/token", server.uri()));
        let token = source.managed_identity(None).await.unwrap();
        assert_eq!(token, "imds-token");
    }

    #[tokio::test]
    async fn test_workload_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-2/oauth2/v2.0/token"))
            .and(body_string_contains("client_assertion=federated-jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "wi-token"
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token");
        std::fs::write(&token_file, "federated-jwt\n").unwrap();

        let source = AzureTokenSource::new(AzureEnvironment::Public, Some(&server.uri()));
        let token = source
            .workload_identity("tenant-2", "app", token_file.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(token, "wi-token");
    }

    #[test]
    fn test_scope_per_environment() {
        assert_eq!(
            AzureTokenSource::new(AzureEnvironment::German, None).scope(),
            "https://ossrdbms-aad.database.chinacloudapi.de/.default"
        );
        assert_eq!(
            AzureTokenSource::new(AzureEnvironment::Public, None).token_endpoint("t"),
            "https://login.microsoftonline.com/t/oauth2/v2.0/token"
        );
    }
}
