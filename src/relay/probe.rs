//! One-shot reachability check for the SOCKS5 proxy.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use super::error::{RelayError, RelayResult};
use crate::config::{ClientConfig, ProxyConfig};

/// Checks that the proxy accepts TCP connections.
///
/// Used as a gate before connecting to relays that require the proxy. It
/// does not speak SOCKS; an accepted TCP connection is enough.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    proxy: ProxyConfig,
    timeout: Duration,
}

impl ConnectivityProbe {
    /// Creates a probe for `proxy` with the given deadline.
    #[must_use]
    pub const fn new(proxy: ProxyConfig, timeout: Duration) -> Self {
        Self { proxy, timeout }
    }

    /// Creates a probe from the client configuration.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.proxy.clone(), config.probe_timeout)
    }

    /// Opens and immediately drops a connection to the proxy.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ProxyUnreachable`] on timeout or connection error.
    pub async fn check(&self) -> RelayResult<()> {
        let attempt = TcpStream::connect((self.proxy.host.as_str(), self.proxy.port));
        self.settle(attempt).await
    }

    async fn settle(
        &self,
        attempt: impl Future<Output = std::io::Result<TcpStream>>,
    ) -> RelayResult<()> {
        let addr = self.proxy.addr();

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(stream)) => {
                drop(stream);
                info!("Proxy {addr} is reachable");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Proxy {addr} connection test failed: {e}");
                Err(RelayError::ProxyUnreachable {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("Proxy {addr} connection test failed: timeout");
                Err(RelayError::ProxyUnreachable {
                    addr,
                    reason: format!("timeout after {:?}", self.timeout),
                })
            }
        }
    }
}
