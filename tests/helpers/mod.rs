//! Reusable test helpers for relay integration tests.
//!
//! Relays are simulated with the in-memory `MockConnector`; each test
//! scripts the frames a relay sends and inspects the frames it receives.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, EventBuilder, Keys};
use nostr_tor_client::relay::testing::{MockConnector, MockRelay};
use nostr_tor_client::relay::{
    Connector, RelayConnection, RelayEndpoint, RelayNotification, SubscriptionHandlers,
};
use nostr_tor_client::ClientConfig;
use tokio::sync::broadcast;

/// Onion relay used by single-relay tests.
pub const ONION_RELAY: &str = "ws://q6a7m5qkyonzb5fk5yv4jyu3ar44hqedn7wjopg737lit2ckkhx2nyid.onion";

/// Configuration with deadlines short enough for tests.
pub fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_connect_timeout(Duration::from_millis(100))
        .with_publish_timeout(Duration::from_millis(150))
}

/// Creates a signed text note.
pub fn note(content: &str) -> Event {
    EventBuilder::text_note(content)
        .sign_with_keys(&Keys::generate())
        .expect("should sign note")
}

/// Owned URL list.
pub fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

/// A connected connection to `url` and the relay side of its transport.
pub struct ConnectedRelay {
    pub connection: RelayConnection,
    pub relay: MockRelay,
    pub notifications: broadcast::Receiver<RelayNotification>,
}

impl ConnectedRelay {
    /// Opens a connection through a fresh mock connector.
    pub async fn open(url: &str) -> Self {
        let connector = Arc::new(MockConnector::new());
        let endpoint = RelayEndpoint::parse(url).expect("valid relay url");
        let connection = RelayConnection::new(
            endpoint,
            Arc::clone(&connector) as Arc<dyn Connector>,
            &fast_config(),
        );
        let notifications = connection.notifications();

        connection.connect().await.expect("mock relay should open");
        let relay = connector.take_relay(url).expect("opened relay is kept");

        Self {
            connection,
            relay,
            notifications,
        }
    }

    /// Waits until every frame sent so far has been processed.
    ///
    /// Frames are handled in order, so a NOTICE sent last is seen last.
    pub async fn flush(&mut self) {
        let marker = format!("flush-{}", FLUSH_COUNTER.fetch_add(1, Ordering::SeqCst));
        self.relay
            .send(serde_json::json!(["NOTICE", marker]).to_string());

        loop {
            match self.notifications.recv().await {
                Ok(RelayNotification::Notice(text)) if text == marker => return,
                Ok(_) => {}
                Err(e) => panic!("notification channel failed: {e}"),
            }
        }
    }
}

static FLUSH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Handlers that count events and end-of-stored-events signals.
pub struct Counters {
    pub events: Arc<AtomicUsize>,
    pub eose: Arc<AtomicUsize>,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            events: Arc::new(AtomicUsize::new(0)),
            eose: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handlers(&self) -> Arc<SubscriptionHandlers> {
        let (events, eose) = (Arc::clone(&self.events), Arc::clone(&self.eose));
        Arc::new(
            SubscriptionHandlers::new()
                .with_event(move |_| {
                    events.fetch_add(1, Ordering::SeqCst);
                })
                .with_eose(move || {
                    eose.fetch_add(1, Ordering::SeqCst);
                }),
        )
    }

    pub fn events(&self) -> usize {
        self.events.load(Ordering::SeqCst)
    }

    pub fn eose(&self) -> usize {
        self.eose.load(Ordering::SeqCst)
    }
}
