//! Error types for relay operations.
//!
//! This module defines the errors that can occur while connecting to a
//! relay, exchanging protocol frames with it, or reaching the proxy.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during relay operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Invalid relay URL.
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// The transport failed before the connection was established.
    #[error("Failed to connect to relay {url}: {reason}")]
    Connection {
        /// The relay URL that failed.
        url: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The transport did not open before the connect deadline.
    #[error("Connection to relay {url} timed out after {timeout:?}")]
    ConnectTimeout {
        /// The relay URL that timed out.
        url: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// Operation attempted while the relay is not connected.
    #[error("Not connected to relay {url}")]
    NotConnected {
        /// The relay URL.
        url: String,
    },

    /// The connection was closed by the caller and cannot be reused.
    #[error("Connection to relay {url} is closed")]
    Closed {
        /// The relay URL.
        url: String,
    },

    /// Subscription request could not be sent.
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// No acknowledgment arrived before the publish deadline.
    #[error("Publish of event {event_id} timed out")]
    PublishTimeout {
        /// Hex id of the event.
        event_id: String,
    },

    /// Relay rejected the event.
    #[error("Relay {relay} rejected event: {reason}")]
    Rejected {
        /// The relay that rejected the event.
        relay: String,
        /// The rejection reason.
        reason: String,
    },

    /// The transport closed while the operation was pending.
    #[error("Connection to relay {url} lost")]
    ConnectionLost {
        /// The relay URL.
        url: String,
    },

    /// A frame could not be handed to the transport.
    #[error("Failed to send frame: {0}")]
    Send(String),

    /// An inbound frame could not be decoded.
    #[error("Failed to decode relay message: {0}")]
    Decode(String),

    /// The proxy did not accept a TCP connection.
    #[error("Proxy {addr} unreachable: {reason}")]
    ProxyUnreachable {
        /// `host:port` of the proxy.
        addr: String,
        /// The reason for the failure.
        reason: String,
    },

    /// SOCKS5 negotiation with the proxy failed.
    #[error("SOCKS5 handshake failed: {0}")]
    Socks(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
