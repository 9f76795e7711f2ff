//! Caller-facing connection pieces
//!
//! * [`ConnectOptions`]: options assembled for one connect, rendered as a masked DSN
//! * [`ConnectionRecord`]: the cached handle with version and flavor predicates

pub mod connection_string;
mod record;

pub use connection_string::ConnectOptions;
pub use record::{ConnectionRecord, Flavor};
