//! Counter helpers

use metrics::counter;

/// One connect-and-ping attempt finished with `outcome`
pub fn connect_attempt(outcome: &'static str) {
    counter!("mysql_broker_connect_attempts_total", "outcome" => outcome).increment(1);
}

/// A failed attempt is about to be retried
pub fn connect_retry() {
    counter!("mysql_broker_connect_retries_total").increment(1);
}

/// A credential source finished resolving
pub fn credential_resolution(provider: &'static str, outcome: &'static str) {
    counter!(
        "mysql_broker_credential_resolutions_total",
        "provider" => provider,
        "outcome" => outcome
    )
    .increment(1);
}

/// Cache lookup result (`hit` or `miss`)
pub fn cache_lookup(result: &'static str) {
    counter!("mysql_broker_cache_lookups_total", "result" => result).increment(1);
}

/// Authentication with `plugin` finished with `outcome`
pub fn auth(plugin: &str, outcome: &'static str) {
    counter!(
        "mysql_broker_auth_total",
        "plugin" => plugin.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
