//! Client configuration.
//!
//! Every tunable of the client lives in [`ClientConfig`], which is built
//! once and passed into [`RelayPool`](crate::relay::RelayPool) and
//! [`RelayConnection`](crate::relay::RelayConnection) constructors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Default Tor SOCKS port on localhost.
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";

/// Default Tor SOCKS port.
pub const DEFAULT_PROXY_PORT: u16 = 9050;

/// Onion relays used when the caller names none.
pub const DEFAULT_ONION_RELAYS: [&str; 2] = [
    // Azzamo Premium Nostr relay (paid)
    "ws://q6a7m5qkyonzb5fk5yv4jyu3ar44hqedn7wjopg737lit2ckkhx2nyid.onion",
    // Azzamo Group and Private message relay (freemium)
    "ws://gp5kiwqfw7t2fwb3rfts2aekoph4x7pj5pv65re2y6hzaujsxewanbqd.onion",
];

/// Address of the SOCKS5 proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

impl ProxyConfig {
    /// `host:port`, for display and logging.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            port: DEFAULT_PROXY_PORT,
        }
    }
}

/// Configuration for relay connections, the pool and the proxy probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// SOCKS5 proxy used for `.onion` relays.
    pub proxy: ProxyConfig,

    /// Relays used when the caller does not name any.
    pub default_relays: Vec<String>,

    /// Deadline for a relay transport to open.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Deadline for a relay to acknowledge a published event.
    #[serde(with = "duration_secs")]
    pub publish_timeout: Duration,

    /// Deadline for the proxy reachability probe.
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,

    /// How long the command line client observes events before exiting.
    #[serde(with = "duration_secs")]
    pub observation_window: Duration,

    /// Filters used for the observation subscription.
    pub default_filters: Vec<Value>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            default_relays: DEFAULT_ONION_RELAYS.iter().map(ToString::to_string).collect(),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            observation_window: Duration::from_secs(30),
            default_filters: vec![json!({"kinds": [1], "limit": 5})],
        }
    }
}

impl ClientConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a field has the wrong type.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets the proxy address.
    #[must_use]
    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = ProxyConfig {
            host: host.into(),
            port,
        };
        self
    }

    /// Sets the connect deadline.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the publish acknowledgment deadline.
    #[must_use]
    pub const fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the proxy probe deadline.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the observation window.
    #[must_use]
    pub const fn with_observation_window(mut self, window: Duration) -> Self {
        self.observation_window = window;
        self
    }

    /// Replaces the default relay list.
    #[must_use]
    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.default_relays = relays;
        self
    }

    /// Replaces the observation filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<Value>) -> Self {
        self.default_filters = filters;
        self
    }
}

/// Durations are written as (possibly fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
