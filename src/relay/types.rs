//! Types for relay management.
//!
//! This module defines relay endpoints, connection status and the
//! per-relay outcome records used by the pool.

use std::fmt;

use url::Url;

use super::error::{RelayError, RelayResult};

/// Host suffix of endpoints that are only reachable through Tor.
const ONION_SUFFIX: &str = ".onion";

/// Connection status for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Not connected to the relay.
    Disconnected,

    /// Connecting to the relay.
    Connecting,

    /// Connected and ready.
    Connected,

    /// Closed by the caller. Terminal.
    Closed,
}

/// A relay address and the transport it requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayEndpoint {
    url: Url,
    requires_anonymity: bool,
}

impl RelayEndpoint {
    /// Parses a relay URL.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidUrl`] if the string is not a `ws://`
    /// or `wss://` URL with a host.
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let url = Url::parse(raw).map_err(|e| RelayError::InvalidUrl(format!("{raw}: {e}")))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RelayError::InvalidUrl(format!(
                "{raw}: scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| RelayError::InvalidUrl(format!("{raw}: missing host")))?;
        let requires_anonymity = is_onion_host(host);

        Ok(Self {
            url,
            requires_anonymity,
        })
    }

    /// The relay URL as written by the caller, without a trailing slash.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }

    /// The parsed URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the endpoint must be reached through the anonymizing proxy.
    #[must_use]
    pub const fn requires_anonymity(&self) -> bool {
        self.requires_anonymity
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `raw` is a relay URL whose host is an onion service.
#[must_use]
pub fn is_onion_url(raw: &str) -> bool {
    RelayEndpoint::parse(raw).is_ok_and(|endpoint| endpoint.requires_anonymity())
}

fn is_onion_host(host: &str) -> bool {
    host.to_ascii_lowercase().ends_with(ONION_SUFFIX)
}

/// Outcome of one pool operation on one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolResult {
    /// The relay URL.
    pub url: String,
    /// Whether the operation succeeded on this relay.
    pub success: bool,
    /// Failure description, if any.
    pub error: Option<String>,
}

impl PoolResult {
    /// A successful outcome.
    #[must_use]
    pub fn ok(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: true,
            error: None,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(url: impl Into<String>, error: &RelayError) -> Self {
        Self {
            url: url.into(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Result of [`RelayPool::connect_all`](super::RelayPool::connect_all).
#[derive(Debug, Clone)]
pub struct ConnectSummary {
    /// Number of relays requested.
    pub requested: usize,
    /// Number of relays now in the live set.
    pub connected: usize,
    /// Per-relay outcomes, in no particular order.
    pub results: Vec<PoolResult>,
}

impl ConnectSummary {
    /// Returns true if no relay connected.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.connected == 0
    }
}

impl fmt::Display for ConnectSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} connected", self.connected, self.requested)
    }
}
