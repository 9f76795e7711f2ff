//! Metrics emitted by the broker
//!
//! Thin wrappers over the `metrics` facade. The crate never installs a
//! recorder; without one every call is a no-op.
//!
//! | Metric | Type | Labels |
//! |---|---|---|
//! | `mysql_broker_connect_attempts_total` | counter | `outcome` |
//! | `mysql_broker_connect_retries_total` | counter | |
//! | `mysql_broker_credential_resolutions_total` | counter | `provider`, `outcome` |
//! | `mysql_broker_cache_lookups_total` | counter | `result` |
//! | `mysql_broker_auth_total` | counter | `plugin`, `outcome` |
//! | `mysql_broker_connect_duration_ms` | histogram | |
//! | `mysql_broker_auth_duration_ms` | histogram | `plugin` |

pub mod counters;
pub mod histograms;
pub mod labels;
