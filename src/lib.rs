//! Nostr Tor Client Library
//!
//! A Nostr relay client that reaches `.onion` relays through a local Tor
//! SOCKS5 proxy and clearnet relays directly. It manages per-relay
//! connections, subscriptions and event publication, and fans them out
//! across many relays with per-relay outcome reporting.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod config;
pub mod relay;

pub use config::{ClientConfig, ProxyConfig};
pub use relay::{RelayError, RelayPool, RelayResult};
