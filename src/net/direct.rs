//! Direct TCP and Unix socket dialing

use super::Dialer;
use crate::config::Endpoint;
use crate::connection::Transport;
use crate::{Error, Result};
use async_trait::async_trait;

/// Dials the endpoint without any tunnel
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &Endpoint) -> Result<Transport> {
        match target {
            Endpoint::Tcp { host, port } => Transport::connect_tcp(host, *port).await,
            Endpoint::Unix(path) => Transport::connect_unix(path).await,
            Endpoint::CloudSql { instance } => Err(Error::Config(format!(
                "cloudsql instance {} must be dialed through the Cloud SQL connector",
                instance
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
