//! Process-wide connection cache
//!
//! One [`ConnectionRecord`] per distinct configuration identity. A single lock
//! guards lookup *and* construction, so concurrent first-time callers never
//! dial twice; at most one connect runs at a time per cache. Use of a cached
//! record is not serialized here beyond the record's own connection lock.
//!
//! Hits are returned as-is: no credential refresh, no re-dial, no health
//! check. Failed connects are never stored.

use crate::auth::CredentialSource;
use crate::broker::ConnectionBroker;
use crate::client::ConnectionRecord;
use crate::config::{Configuration, Endpoint};
use crate::metrics::{counters, labels};
use crate::net::ProxySpec;
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Canonical identity of a configuration
///
/// Secrets never appear in the key: the static password contributes only its
/// SHA-256 digest, and provider keys and tokens contribute at most their
/// presence.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Canonical key for a configuration
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let tls_mode = config.tls_mode()?;
        let proxy = match config.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(raw) => Some(ProxySpec::parse(raw)?),
            None => None,
        };

        let network = match (&endpoint, &proxy) {
            (Endpoint::Unix(_), _) => "unix",
            (Endpoint::CloudSql { .. }, _) => "cloudsql",
            (Endpoint::Tcp { .. }, Some(_)) => "proxied",
            (Endpoint::Tcp { .. }, None) => "tcp",
        };

        let mut fields: Vec<(&'static str, String)> = vec![
            ("net", network.to_string()),
            ("addr", endpoint.address()),
            ("user", config.username.clone()),
            ("source", CredentialSource::for_config(config).name().to_string()),
            ("tls", tls_mode.to_string()),
            ("plugin", config.authentication_plugin.clone()),
        ];

        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            fields.push(("pw", hex_digest([password.as_bytes()])));
        }
        if let Some(bundle) = &config.custom_tls {
            fields.push((
                "tls_bundle",
                hex_digest([
                    bundle.key().as_bytes(),
                    bundle.ca_cert.as_bytes(),
                    bundle.client_cert.as_deref().unwrap_or_default().as_bytes(),
                    bundle.client_key.as_deref().unwrap_or_default().as_bytes(),
                ]),
            ));
        }
        if let Some(proxy) = &proxy {
            fields.push(("proxy", proxy.masked()));
        }
        if config.uses_cloudsql() {
            fields.push(("iam", config.iam_database_authentication.to_string()));
            fields.push(("private_ip", config.private_ip.to_string()));
        }
        if let Some(aws) = &config.aws_config {
            push_opt(&mut fields, "aws_region", &aws.region);
            push_opt(&mut fields, "aws_profile", &aws.profile);
            push_opt(&mut fields, "aws_role", &aws.role_arn);
            if let Some(key) = aws.access_key.as_deref().filter(|k| !k.is_empty()) {
                fields.push(("aws_key", hex_digest([key.as_bytes()])));
            }
            fields.push(("aws_iam", aws.aws_rds_iam_auth.to_string()));
        }
        if let Some(azure) = &config.azure_config {
            push_opt(&mut fields, "azure_tenant", &azure.tenant_id);
            push_opt(&mut fields, "azure_client", &azure.client_id);
            fields.push(("azure_env", azure.environment().as_str().to_string()));
        }

        let params: BTreeMap<&String, &String> = config.conn_params.iter().collect();

        let mut key = String::new();
        for (name, value) in &fields {
            let _ = write!(key, "{}={};", name, value);
        }
        for (name, value) in params {
            let _ = write!(key, "param.{}={};", name, value);
        }

        Ok(Self(key))
    }

    /// Rendered key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.0).finish()
    }
}

fn push_opt(fields: &mut Vec<(&'static str, String)>, name: &'static str, value: &Option<String>) {
    if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
        fields.push((name, value.to_string()));
    }
}

fn hex_digest<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{:02x}", byte);
            out
        })
}

/// Connection cache backed by a [`ConnectionBroker`]
///
/// Create one per provider activation and call [`ConnectionCache::shutdown`]
/// when done.
#[derive(Debug)]
pub struct ConnectionCache {
    broker: ConnectionBroker,
    entries: Mutex<HashMap<CacheKey, Arc<ConnectionRecord>>>,
}

impl ConnectionCache {
    /// Empty cache
    pub fn new(broker: ConnectionBroker) -> Self {
        Self {
            broker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Broker used on misses
    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    /// Cached record for `config`, connecting on a miss
    ///
    /// The cache lock is held across the whole connect, including retries.
    pub async fn get_or_create(
        &self,
        config: &Configuration,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionRecord>> {
        let key = CacheKey::from_config(config)?;
        let mut entries = self.entries.lock().await;

        if let Some(record) = entries.get(&key) {
            counters::cache_lookup(labels::CACHE_HIT);
            tracing::debug!(endpoint = %config.endpoint, "connection cache hit");
            return Ok(record.clone());
        }

        counters::cache_lookup(labels::CACHE_MISS);
        tracing::debug!(endpoint = %config.endpoint, "connection cache miss");

        let record = Arc::new(self.broker.connect(config, cancel).await?);
        entries.insert(key, record.clone());
        Ok(record)
    }

    /// Cached record without connecting
    pub async fn get(&self, config: &Configuration) -> Result<Option<Arc<ConnectionRecord>>> {
        let key = CacheKey::from_config(config)?;
        Ok(self.entries.lock().await.get(&key).cloned())
    }

    /// Number of cached records
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is cached
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Close every record no caller still holds; the rest close on their last drop
    pub async fn shutdown(self) {
        let entries = self.entries.into_inner();
        for (key, record) in entries {
            match Arc::try_unwrap(record) {
                Ok(record) => {
                    if let Err(err) = record.close().await {
                        tracing::debug!(key = %key, error = %err, "close on shutdown failed");
                    }
                }
                Err(_) => tracing::debug!(key = %key, "record still in use at shutdown"),
            }
        }
    }
}
