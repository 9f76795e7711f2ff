//! Connection broker
//!
//! Turns a [`Configuration`] into one ready [`ConnectionRecord`]:
//!
//! 1. resolve the credential ([`CredentialSource`])
//! 2. register custom TLS material and pick the TLS context
//! 3. select the dial path ([`DialSpec`]) and assemble login options
//! 4. dial + login + ping, retried within `connect_retry_timeout`
//! 5. normalize the session SQL mode for the server version
//! 6. probe the data directory for the server flavor
//!
//! The broker keeps no per-connection state; every call starts from `Idle`.
//! Cancellation is observed at every await point, including mid-backoff.

pub mod probe;
pub mod retry;
pub mod session;
pub mod state;

pub use retry::{classify, AttemptOutcome, RetryBudget};
pub use session::{quote_identifier, session_statement};
pub use state::AttemptState;

use crate::auth::CredentialSource;
use crate::client::{ConnectOptions, ConnectionRecord};
use crate::config::Configuration;
use crate::connection::{Connection, ConnectionConfig, TlsRegistry};
use crate::metrics::{counters, histograms, labels};
use crate::net::{DialSpec, Dialer};
use crate::{Error, Result};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Builds ready connections from configurations
#[derive(Debug, Clone, Default)]
pub struct ConnectionBroker {
    tls_registry: TlsRegistry,
    dialer: Option<Arc<dyn Dialer>>,
}

impl ConnectionBroker {
    /// Broker with an empty TLS registry and the dialer chosen per configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the network dialer for every connect
    ///
    /// A Cloud SQL connector supplied by the credential still takes precedence.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Use a shared TLS registry
    pub fn with_tls_registry(mut self, registry: TlsRegistry) -> Self {
        self.tls_registry = registry;
        self
    }

    /// Named TLS contexts available to configurations
    pub fn tls_registry(&self) -> &TlsRegistry {
        &self.tls_registry
    }

    /// Build one ready connection
    ///
    /// Failures other than cancellation and budget exhaustion come back as
    /// [`Error::Connect`] carrying the configured endpoint and the failure class.
    pub async fn connect(
        &self,
        config: &Configuration,
        cancel: &CancellationToken,
    ) -> Result<ConnectionRecord> {
        let started = Instant::now();
        let endpoint = config.endpoint.clone();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = self
                .connect_inner(config)
                .instrument(tracing::info_span!("connect", endpoint = %endpoint, user = %config.username)) => result,
        };

        histograms::connect_duration(started.elapsed());

        result.map_err(|err| {
            tracing::warn!(endpoint = %endpoint, class = %err.class(), error = %err, "connect failed");
            connect_error(endpoint, err)
        })
    }

    async fn connect_inner(&self, config: &Configuration) -> Result<ConnectionRecord> {
        let mut state = AttemptState::Idle;

        state.transition(AttemptState::ResolvingCredential)?;
        let source = CredentialSource::for_config(config);
        let credential = source.resolve(config).await?;

        if let Some(bundle) = &config.custom_tls {
            self.tls_registry.register_custom(bundle).await?;
        }
        let tls = self.tls_registry.resolve(&config.tls_mode()?).await?;

        let spec = DialSpec::from_config(config)?;
        let dialer = credential
            .dialer()
            .or_else(|| self.dialer.clone())
            .unwrap_or_else(|| spec.dialer());

        let options = ConnectOptions::assemble(config, &credential, &spec, tls)?;
        tracing::debug!(
            dsn = %options,
            source = source.name(),
            dialer = dialer.name(),
            "connect options assembled"
        );
        if let Some(requested) = config.max_open_conns.filter(|n| *n != 1) {
            tracing::debug!(
                requested,
                effective = config.effective_max_open_conns(),
                "max_open_conns pinned to a single connection"
            );
        }

        let login = options.to_connection_config();
        let mut conn = dial_with_retry(
            dialer.as_ref(),
            &spec,
            &login,
            config.connect_retry_timeout,
            &mut state,
        )
        .await?;

        state.transition(AttemptState::Connected)?;
        match normalize_and_probe(&mut conn, &mut state).await {
            Ok((version, flavor)) => {
                state.transition(AttemptState::Ready)?;
                tracing::info!(
                    version = %version,
                    flavor = flavor.name(),
                    tls = conn.is_tls(),
                    "connection ready"
                );
                Ok(ConnectionRecord::new(
                    conn,
                    version,
                    flavor,
                    options.dsn(),
                    config.max_conn_lifetime,
                ))
            }
            Err(err) => {
                if let Err(close_err) = conn.close().await {
                    tracing::debug!(error = %close_err, "close after failed probe");
                }
                Err(err)
            }
        }
    }
}

/// Dial, log in and ping until success, an abort, or the budget runs out
async fn dial_with_retry(
    dialer: &dyn Dialer,
    spec: &DialSpec,
    login: &ConnectionConfig,
    timeout: Duration,
    state: &mut AttemptState,
) -> Result<Connection> {
    let mut budget = RetryBudget::new(timeout);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        state.transition(AttemptState::Dialing { attempt })?;

        let remaining = budget.remaining();
        let result = match tokio::time::timeout(remaining, connect_once(dialer, spec, login)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("attempt did not finish within the remaining {:?}", remaining),
            ))),
        };

        let err = match classify(result) {
            AttemptOutcome::Success(conn) => {
                counters::connect_attempt(labels::OUTCOME_SUCCESS);
                tracing::debug!(attempt, "connected");
                return Ok(conn);
            }
            AttemptOutcome::Abort(err) => {
                counters::connect_attempt(labels::OUTCOME_ABORT);
                tracing::debug!(attempt, error = %err, "attempt aborted");
                return Err(err);
            }
            AttemptOutcome::Retry(err) => err,
        };

        let Some(delay) = budget.next_backoff() else {
            counters::connect_attempt(labels::OUTCOME_ABORT);
            return Err(retry_timeout(spec, &budget, err));
        };

        counters::connect_attempt(labels::OUTCOME_RETRY);
        counters::connect_retry();
        tracing::warn!(
            attempt,
            error = %err,
            backoff_ms = delay.as_millis() as u64,
            "connect attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;

        if budget.is_exhausted() {
            return Err(retry_timeout(spec, &budget, err));
        }
    }
}

/// One attempt: dial, log in, ping
async fn connect_once(
    dialer: &dyn Dialer,
    spec: &DialSpec,
    login: &ConnectionConfig,
) -> Result<Connection> {
    let transport = dialer.dial(&spec.target).await?;
    let mut conn = Connection::establish(transport, login).await?;
    conn.ping().await?;
    Ok(conn)
}

async fn normalize_and_probe(
    conn: &mut Connection,
    state: &mut AttemptState,
) -> Result<(crate::ServerVersion, crate::Flavor)> {
    let (banner, version) = probe::server_version(conn).await?;
    let statement = session_statement(&version);
    conn.execute(statement).await?;
    tracing::debug!(version = %version, statement, "session normalized");
    state.transition(AttemptState::SessionNormalized)?;

    let datadir = probe::datadir(conn).await?;
    let flavor = probe::parse_flavor(&banner, &datadir);
    state.transition(AttemptState::VersionProbed)?;
    Ok((version, flavor))
}

fn retry_timeout(spec: &DialSpec, budget: &RetryBudget, last: Error) -> Error {
    Error::RetryTimeout {
        endpoint: spec.target.address(),
        timeout: budget.timeout(),
        source: Box::new(last),
    }
}

fn connect_error(endpoint: String, err: Error) -> Error {
    match err {
        Error::Canceled | Error::RetryTimeout { .. } | Error::Connect { .. } => err,
        err => Error::Connect {
            endpoint,
            class: err.class(),
            source: Box::new(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorClass;

    #[test]
    fn test_connect_error_wraps_with_class() {
        let err = connect_error("db:3306".into(), Error::Config("bad proxy".into()));
        assert_eq!(err.class(), ErrorClass::Config);
        assert!(matches!(err, Error::Connect { ref endpoint, .. } if endpoint == "db:3306"));
    }

    #[test]
    fn test_connect_error_keeps_cancel_and_timeout() {
        assert!(matches!(
            connect_error("db".into(), Error::Canceled),
            Error::Canceled
        ));
        let timeout = Error::RetryTimeout {
            endpoint: "db:3306".into(),
            timeout: Duration::from_secs(1),
            source: Box::new(Error::ConnectionClosed),
        };
        assert!(matches!(
            connect_error("db".into(), timeout),
            Error::RetryTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_password_with_iam_fails_before_network() {
        let config = Configuration::builder("aws://db.internal:3306", "admin")
            .password("secret")
            .build();
        let err = ConnectionBroker::new()
            .connect(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[tokio::test]
    async fn test_canceled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = Configuration::builder("127.0.0.1:1", "admin").build();
        let err = ConnectionBroker::new()
            .connect(&config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}
