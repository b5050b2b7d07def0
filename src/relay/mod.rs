//! Relay protocol engine.
//!
//! This module implements the Nostr client side of the relay protocol:
//! connection lifecycle, the REQ / EVENT / CLOSE framed exchange, and
//! fan-out across many relays.
//!
//! # Architecture
//!
//! ```text
//! caller
//!     │
//!     ▼
//! RelayPool ──────────────▶ RelayConnection (one per relay)
//!                                 │
//!                                 ▼
//!                           Connector (transport)
//!                            │            │
//!                         direct     SOCKS5 proxy (Tor)
//!                            │            │
//!                            ▼            ▼
//!                        ws/wss relay   .onion relay
//! ```
//!
//! # Routing
//!
//! | Endpoint host | Connector |
//! |---------------|-----------|
//! | `*.onion` | WebSocket through the configured SOCKS5 proxy |
//! | anything else | direct WebSocket |
//!
//! Use [`ConnectivityProbe`] to check the proxy before connecting to
//! `.onion` relays.

mod connection;
mod error;
mod message;
mod pool;
mod probe;
mod socks;
mod subscription;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
mod transport;
mod types;

pub use connection::{RelayConnection, RelayNotification, Subscription};
pub use error::{RelayError, RelayResult};
pub use message::{ClientMessage, RelayMessage};
pub use pool::{PoolNotification, PoolSubscription, RelayPool};
pub use probe::ConnectivityProbe;
pub use subscription::{
    generate_subscription_id, PoolSubscriptionHandler, SubscriptionEvent, SubscriptionHandler,
    SubscriptionHandlers,
};
pub use transport::{
    channel_pair, Connector, TransportChannel, TransportCommand, TransportEvent, TransportPeer,
    TransportSender, Transports, WebSocketConnector,
};
pub use types::{is_onion_url, ConnectSummary, PoolResult, RelayEndpoint, RelayStatus};
