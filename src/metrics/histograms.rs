//! Histogram helpers

use metrics::histogram;
use std::time::Duration;

/// Wall time of a whole `connect` call, retries included
pub fn connect_duration(elapsed: Duration) {
    histogram!("mysql_broker_connect_duration_ms").record(elapsed.as_secs_f64() * 1000.0);
}

/// Wall time of the authentication exchange
pub fn auth_duration(plugin: &str, elapsed: Duration) {
    histogram!("mysql_broker_auth_duration_ms", "plugin" => plugin.to_string())
        .record(elapsed.as_secs_f64() * 1000.0);
}
