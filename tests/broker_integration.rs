//! End-to-end broker and cache tests against an in-process MySQL server

mod common;

use common::{CountingDialer, MockServer, ServerProfile};
use mysql_broker::{ConnectionBroker, ConnectionCache, Error, ErrorClass};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let dialer = CountingDialer::failing_first(3);
    let broker = ConnectionBroker::new().with_dialer(dialer.clone());

    let record = broker
        .connect(&server.config(), &CancellationToken::new())
        .await
        .expect("connect after retries");

    assert_eq!(dialer.dials(), 4);
    assert_eq!(record.version().to_string(), "8.0.36");
    assert_eq!(server.logins(), 1);
}

#[tokio::test]
async fn test_engine_error_aborts_immediately() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36").denying_login()).await;
    let dialer = CountingDialer::new();
    let broker = ConnectionBroker::new().with_dialer(dialer.clone());

    let err = broker
        .connect(&server.config(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(dialer.dials(), 1);
    assert_eq!(err.class(), ErrorClass::FatalEngine);
    assert_eq!(err.server_code(), Some(1045));
    assert!(err.to_string().contains(&server.endpoint()));
}

#[tokio::test]
async fn test_budget_exhaustion_wraps_last_error() {
    let dialer = CountingDialer::always_failing();
    let broker = ConnectionBroker::new().with_dialer(dialer.clone());
    let config = mysql_broker::Configuration::builder("127.0.0.1:9", "root")
        .connect_retry_timeout(Duration::from_millis(500))
        .build();

    let started = Instant::now();
    let err = broker
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RetryTimeout { .. }), "got {err:?}");
    assert_eq!(err.class(), ErrorClass::TransientNetwork);
    assert!(dialer.dials() >= 2);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_cancel_aborts_mid_backoff() {
    let dialer = CountingDialer::always_failing();
    let broker = ConnectionBroker::new().with_dialer(dialer.clone());
    let config = mysql_broker::Configuration::builder("127.0.0.1:9", "root").build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = broker.connect(&config, &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Canceled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrent_first_use_dials_once() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let dialer = CountingDialer::new();
    let cache = Arc::new(ConnectionCache::new(
        ConnectionBroker::new().with_dialer(dialer.clone()),
    ));
    let config = server.config();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let config = config.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create(&config, &CancellationToken::new())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let records = futures::future::join_all(tasks).await;
    let first = records[0].as_ref().unwrap().clone();
    for record in &records {
        assert!(Arc::ptr_eq(&first, record.as_ref().unwrap()));
    }
    assert_eq!(dialer.dials(), 1);
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_distinct_identities_get_distinct_connections() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let dialer = CountingDialer::new();
    let cache = ConnectionCache::new(ConnectionBroker::new().with_dialer(dialer.clone()));

    let admin = server.config();
    let mut other = server.config();
    other.username = "provisioner".into();

    let a = cache.get_or_create(&admin, &CancellationToken::new()).await.unwrap();
    let b = cache.get_or_create(&other, &CancellationToken::new()).await.unwrap();
    let again = cache.get_or_create(&admin, &CancellationToken::new()).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn test_failed_connect_is_retried_from_scratch() {
    let dialer = CountingDialer::always_failing();
    let cache = ConnectionCache::new(ConnectionBroker::new().with_dialer(dialer.clone()));
    let config = mysql_broker::Configuration::builder("127.0.0.1:9", "root")
        .connect_retry_timeout(Duration::from_millis(150))
        .build();

    assert!(cache.get_or_create(&config, &CancellationToken::new()).await.is_err());
    let after_first = dialer.dials();
    assert!(cache.get_or_create(&config, &CancellationToken::new()).await.is_err());
    assert!(dialer.dials() > after_first);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_mysql57_disables_auto_create_user() {
    let server = MockServer::start(ServerProfile::mysql("5.7.6-x")).await;
    let record = ConnectionBroker::new()
        .connect(&server.config(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(server
        .queries()
        .contains(&"SET SESSION sql_mode='NO_AUTO_CREATE_USER'".to_string()));
    assert_eq!(record.version().minor(), 7);
}

#[tokio::test]
async fn test_mysql8_clears_sql_mode() {
    let server = MockServer::start(ServerProfile::mysql("8.0.1")).await;
    ConnectionBroker::new()
        .connect(&server.config(), &CancellationToken::new())
        .await
        .unwrap();

    let queries = server.queries();
    assert!(queries.contains(&"SET SESSION sql_mode=''".to_string()));
    assert!(!queries.iter().any(|q| q.contains("NO_AUTO_CREATE_USER")));
}

#[tokio::test]
async fn test_tidb_flavor_detected() {
    let server = MockServer::start(ServerProfile::mysql("5.7.20-TiDB-v7.1.0")).await;
    let record = ConnectionBroker::new()
        .connect(&server.config(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(record.is_tidb());
    assert_eq!(record.tidb_version(), Some("v7.1.0"));
    assert_eq!(record.mysql_compat_version(), Some("5.7.20"));
    assert!(!record.is_rds());
}

#[tokio::test]
async fn test_rds_datadir_detected() {
    let server =
        MockServer::start(ServerProfile::mysql("8.0.35").datadir("/rdsdbdata/db/")).await;
    let record = ConnectionBroker::new()
        .connect(&server.config(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(record.is_rds());
    assert!(!record.is_tidb());
}

#[tokio::test]
async fn test_conn_params_become_session_variables() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let mut config = server.config();
    config.conn_params.insert("sql_log_bin".into(), "0".into());
    config.conn_params.insert("autocommit".into(), "1".into());
    config.conn_params.insert("timeout".into(), "10s".into());

    let record = ConnectionBroker::new()
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap();

    let queries = server.queries();
    assert_eq!(queries[0], "SET autocommit=1");
    assert_eq!(queries[1], "SET sql_log_bin=0");
    assert!(!queries.iter().any(|q| q.contains("timeout")));
    assert!(!record.dsn().contains("secret"));
}

#[tokio::test]
async fn test_record_runs_statements() {
    let server = MockServer::start(ServerProfile::mysql("8.0.36")).await;
    let cache = ConnectionCache::new(ConnectionBroker::new());
    let record = cache
        .get_or_create(&server.config(), &CancellationToken::new())
        .await
        .unwrap();

    record.execute("CREATE DATABASE IF NOT EXISTS app").await.unwrap();
    assert_eq!(
        record.query_scalar("SELECT @@GLOBAL.version").await.unwrap().as_deref(),
        Some("8.0.36")
    );
    record.ping().await.unwrap();
    assert!(server
        .queries()
        .contains(&"CREATE DATABASE IF NOT EXISTS app".to_string()));

    drop(record);
    cache.shutdown().await;
}

#[tokio::test]
async fn test_static_password_with_gcp_iam_is_config_error() {
    let config = mysql_broker::Configuration::builder("cloudsql://proj:us-central1:db", "svc")
        .password("secret")
        .iam_database_authentication(true)
        .build();
    let dialer = CountingDialer::new();

    let err = ConnectionBroker::new()
        .with_dialer(dialer.clone())
        .connect(&config, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Config);
    assert_eq!(dialer.dials(), 0);
}
