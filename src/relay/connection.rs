//! A single relay connection.
//!
//! [`RelayConnection`] owns one transport and runs the protocol state
//! machine for one relay:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──Opened──▶ Connected
//!      ▲                          │                      │
//!      └────── error/timeout ─────┘◀──── transport close ┘
//!
//! any state ──close()──▶ Closed (terminal)
//! ```
//!
//! Registries (open subscriptions, pending publishes) sit behind one
//! connection-scoped mutex. The lock is never held while a caller's handler
//! runs or across an `.await`, so handlers may freely call back into the
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nostr::{Event, EventId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{RelayError, RelayResult};
use super::message::{ClientMessage, RelayMessage};
use super::subscription::{generate_subscription_id, SubscriptionHandler};
use super::transport::{Connector, TransportChannel, TransportEvent, TransportSender};
use super::types::{RelayEndpoint, RelayStatus};
use crate::config::ClientConfig;

/// Capacity of the per-connection notification channel.
const NOTIFICATION_CAPACITY: usize = 64;

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    /// The transport opened.
    Connected,
    /// The transport closed after being connected.
    Disconnected,
    /// The relay sent a NOTICE.
    Notice(String),
    /// The transport reported an error while connected.
    Error(String),
}

/// A publish waiting for its OK frame.
struct Waiter {
    token: u64,
    tx: oneshot::Sender<RelayResult<()>>,
}

struct State {
    status: RelayStatus,
    sender: Option<TransportSender>,
    subscriptions: HashMap<String, Arc<dyn SubscriptionHandler>>,
    pending: HashMap<EventId, Vec<Waiter>>,
    next_token: u64,
}

impl State {
    /// Empties both registries, returning the waiters that must be rejected.
    fn purge(&mut self) -> Vec<Waiter> {
        self.subscriptions.clear();
        self.pending.drain().flat_map(|(_, waiters)| waiters).collect()
    }
}

struct Inner {
    endpoint: RelayEndpoint,
    url: String,
    state: Mutex<State>,
    notifications: broadcast::Sender<RelayNotification>,
}

/// Connection to one relay.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use nostr_tor_client::relay::{RelayConnection, RelayEndpoint, SubscriptionHandlers, WebSocketConnector};
/// use nostr_tor_client::ClientConfig;
///
/// let config = ClientConfig::default();
/// let endpoint = RelayEndpoint::parse("wss://relay.damus.io")?;
/// let relay = RelayConnection::new(endpoint, Arc::new(WebSocketConnector::direct()), &config);
///
/// relay.connect().await?;
/// let sub = relay.subscribe(
///     vec![serde_json::json!({"kinds": [1], "limit": 5})],
///     Arc::new(SubscriptionHandlers::new().with_event(|e| println!("{}", e.content))),
/// )?;
/// // ...
/// sub.close();
/// relay.close();
/// ```
pub struct RelayConnection {
    inner: Arc<Inner>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    publish_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Creates a disconnected connection to `endpoint`.
    ///
    /// `connector` must already be the right one for the endpoint (see
    /// [`Transports::for_endpoint`](super::Transports::for_endpoint)).
    #[must_use]
    pub fn new(endpoint: RelayEndpoint, connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let url = endpoint.as_str().to_string();

        Self {
            inner: Arc::new(Inner {
                endpoint,
                url,
                state: Mutex::new(State {
                    status: RelayStatus::Disconnected,
                    sender: None,
                    subscriptions: HashMap::new(),
                    pending: HashMap::new(),
                    next_token: 0,
                }),
                notifications,
            }),
            connector,
            connect_timeout: config.connect_timeout,
            publish_timeout: config.publish_timeout,
            reader: Mutex::new(None),
        }
    }

    /// The relay URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The relay endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.inner.endpoint
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        self.inner.state.lock().status
    }

    /// Whether the connection is ready for subscribe and publish.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Number of publishes awaiting acknowledgment.
    #[must_use]
    pub fn pending_publish_count(&self) -> usize {
        self.inner.state.lock().pending.values().map(Vec::len).sum()
    }

    /// Receives connection-level notifications from now on.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.inner.notifications.subscribe()
    }

    /// Opens the transport and waits until it is ready.
    ///
    /// Returns immediately if already connected.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Connection`] if the transport fails before opening
    /// - [`RelayError::ConnectTimeout`] if it does not open in time
    /// - [`RelayError::Closed`] if [`close`](Self::close) was called
    pub async fn connect(&self) -> RelayResult<()> {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                RelayStatus::Connected => return Ok(()),
                RelayStatus::Closed => return Err(self.inner.closed()),
                RelayStatus::Connecting => {
                    return Err(RelayError::Connection {
                        url: self.inner.url.clone(),
                        reason: "connection attempt already in progress".to_string(),
                    });
                }
                RelayStatus::Disconnected => state.status = RelayStatus::Connecting,
            }
        }

        if self.inner.endpoint.requires_anonymity() {
            info!("Connecting to {} through proxy", self.inner.url);
        } else {
            info!("Connecting to {}", self.inner.url);
        }

        let TransportChannel { sender, mut events } = self.connector.open(&self.inner.endpoint);
        self.inner.state.lock().sender = Some(sender.clone());

        let failure = match tokio::time::timeout(self.connect_timeout, wait_for_open(&mut events)).await {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(RelayError::Connection {
                url: self.inner.url.clone(),
                reason,
            }),
            Err(_) => Some(RelayError::ConnectTimeout {
                url: self.inner.url.clone(),
                timeout: self.connect_timeout,
            }),
        };

        if let Some(error) = failure {
            sender.close();
            let mut state = self.inner.state.lock();
            if state.status == RelayStatus::Connecting {
                state.status = RelayStatus::Disconnected;
                state.sender = None;
            }
            drop(state);
            warn!("Failed to connect to {}: {}", self.inner.url, error);
            return Err(error);
        }

        {
            let mut state = self.inner.state.lock();
            if state.status != RelayStatus::Connecting {
                drop(state);
                sender.close();
                return Err(self.inner.closed());
            }
            state.status = RelayStatus::Connected;
        }

        info!("Successfully connected to {}", self.inner.url);
        self.inner.notify(RelayNotification::Connected);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.read_loop(events).await;
        });
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Opens a subscription.
    ///
    /// Filters are forwarded verbatim and in order. The subscription is
    /// registered before this returns, so no event can be missed.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotConnected`] if not connected (nothing is sent)
    /// - [`RelayError::Subscription`] if the request cannot be sent
    pub fn subscribe(
        &self,
        filters: Vec<Value>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> RelayResult<Subscription> {
        let mut state = self.inner.state.lock();
        let sender = self.inner.connected_sender(&state)?;

        let subscription_id = loop {
            let candidate = generate_subscription_id();
            if !state.subscriptions.contains_key(&candidate) {
                break candidate;
            }
        };

        let frame = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filters,
        }
        .to_json();
        debug!("Subscribing to {}: {}", self.inner.url, frame);

        sender.send(frame).map_err(|_| {
            RelayError::Subscription(format!("transport to {} is closed", self.inner.url))
        })?;
        state.subscriptions.insert(subscription_id.clone(), handler);
        drop(state);

        info!("Subscribed to {} as {}", self.inner.url, subscription_id);

        Ok(Subscription {
            id: subscription_id,
            relay_url: self.inner.url.clone(),
            connection: Arc::downgrade(&self.inner),
            closed: AtomicBool::new(false),
        })
    }

    /// Publishes an event and waits for the relay's acknowledgment.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotConnected`] if not connected
    /// - [`RelayError::Rejected`] if the relay answers OK with `false`
    /// - [`RelayError::PublishTimeout`] if no OK arrives in time
    /// - [`RelayError::ConnectionLost`] if the connection drops first
    pub async fn publish(&self, event: &Event) -> RelayResult<()> {
        let event_id = event.id;
        let (tx, rx) = oneshot::channel();

        let token = {
            let mut state = self.inner.state.lock();
            let sender = self.inner.connected_sender(&state)?;

            let frame = ClientMessage::Event(Box::new(event.clone())).to_json();
            sender
                .send(frame)
                .map_err(|_| RelayError::Send(format!("transport to {} is closed", self.inner.url)))?;

            state.next_token += 1;
            let token = state.next_token;
            state
                .pending
                .entry(event_id)
                .or_default()
                .push(Waiter { token, tx });
            token
        };

        debug!("Published {} to {}, awaiting OK", event_id, self.inner.url);

        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::ConnectionLost {
                url: self.inner.url.clone(),
            }),
            Err(_) => {
                self.inner.remove_waiter(&event_id, token);
                Err(RelayError::PublishTimeout {
                    event_id: event_id.to_hex(),
                })
            }
        }
    }

    /// Tears down the transport. Idempotent.
    ///
    /// Pending publishes are rejected with [`RelayError::ConnectionLost`] and
    /// all subscriptions are dropped.
    pub fn close(&self) {
        let (was_connected, sender, waiters) = {
            let mut state = self.inner.state.lock();
            if state.status == RelayStatus::Closed {
                return;
            }
            let was_connected = state.status == RelayStatus::Connected;
            state.status = RelayStatus::Closed;
            let waiters = state.purge();
            (was_connected, state.sender.take(), waiters)
        };

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(sender) = sender {
            sender.close();
        }
        self.inner.reject_all(waiters);

        if was_connected {
            info!("Closed connection to {}", self.inner.url);
            self.inner.notify(RelayNotification::Disconnected);
        } else {
            debug!("Closed idle connection to {}", self.inner.url);
        }
    }

    #[cfg(test)]
    fn handle_frame(&self, text: &str) {
        self.inner.handle_frame(text);
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn notify(&self, notification: RelayNotification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    fn closed(&self) -> RelayError {
        RelayError::Closed {
            url: self.url.clone(),
        }
    }

    fn connected_sender(&self, state: &State) -> RelayResult<TransportSender> {
        match (&state.status, &state.sender) {
            (RelayStatus::Connected, Some(sender)) => Ok(sender.clone()),
            _ => Err(RelayError::NotConnected {
                url: self.url.clone(),
            }),
        }
    }

    async fn read_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(text) => self.handle_frame(&text),
                TransportEvent::Error(e) => {
                    warn!("Error from {}: {}", self.url, e);
                    self.notify(RelayNotification::Error(e));
                }
                TransportEvent::Closed => break,
                TransportEvent::Opened => {}
            }
        }

        self.handle_disconnect();
    }

    fn handle_disconnect(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.status != RelayStatus::Connected {
                return;
            }
            state.status = RelayStatus::Disconnected;
            state.sender = None;
            state.purge()
        };

        self.reject_all(waiters);
        info!("Disconnected from {}", self.url);
        self.notify(RelayNotification::Disconnected);
    }

    fn reject_all(&self, waiters: Vec<Waiter>) {
        for waiter in waiters {
            let _ = waiter.tx.send(Err(RelayError::ConnectionLost {
                url: self.url.clone(),
            }));
        }
    }

    fn handle_frame(&self, text: &str) {
        debug!("Received from {}: {}", self.url, text);

        match RelayMessage::from_json(text) {
            Ok(message) => self.dispatch(message),
            Err(e) => warn!("Error parsing message from {}: {}", self.url, e),
        }
    }

    fn dispatch(&self, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => match self.handler(&subscription_id) {
                Some(handler) => handler.on_event(*event),
                None => debug!("Event for unknown subscription {} on {}", subscription_id, self.url),
            },
            RelayMessage::Eose(subscription_id) => match self.handler(&subscription_id) {
                Some(handler) => handler.on_eose(),
                None => debug!("EOSE for unknown subscription {} on {}", subscription_id, self.url),
            },
            RelayMessage::Notice(text) => {
                info!("Notice from {}: {}", self.url, text);
                self.notify(RelayNotification::Notice(text));
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.settle(&event_id, accepted, &message),
            RelayMessage::Unknown(kind) => {
                info!("Unknown message type from {}: {}", self.url, kind);
            }
        }
    }

    fn handler(&self, subscription_id: &str) -> Option<Arc<dyn SubscriptionHandler>> {
        self.state.lock().subscriptions.get(subscription_id).cloned()
    }

    /// Settles every waiter for `event_id`. Later OKs for the id find nothing.
    fn settle(&self, event_id: &EventId, accepted: bool, message: &str) {
        let removed = self.state.lock().pending.remove(event_id);
        let Some(waiters) = removed else {
            debug!("Ignoring OK for unknown or settled event {} from {}", event_id, self.url);
            return;
        };

        for waiter in waiters {
            let result = if accepted {
                Ok(())
            } else {
                Err(RelayError::Rejected {
                    relay: self.url.clone(),
                    reason: if message.is_empty() {
                        "publish failed".to_string()
                    } else {
                        message.to_string()
                    },
                })
            };
            let _ = waiter.tx.send(result);
        }
    }

    fn remove_waiter(&self, event_id: &EventId, token: u64) {
        let mut state = self.state.lock();
        if let Some(waiters) = state.pending.get_mut(event_id) {
            waiters.retain(|w| w.token != token);
            if waiters.is_empty() {
                state.pending.remove(event_id);
            }
        }
    }

    fn unsubscribe(&self, subscription_id: &str) {
        let mut state = self.state.lock();
        if state.subscriptions.remove(subscription_id).is_none() {
            return;
        }

        if let Ok(sender) = self.connected_sender(&state) {
            let frame = ClientMessage::Close(subscription_id.to_string()).to_json();
            if sender.send(frame).is_err() {
                debug!("Transport to {} closed before CLOSE for {}", self.url, subscription_id);
            }
        }
        drop(state);

        debug!("Closed subscription {} on {}", subscription_id, self.url);
    }
}

/// Waits for the transport to open, ignoring anything that arrives first.
async fn wait_for_open(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Result<(), String> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Opened) => return Ok(()),
            Some(TransportEvent::Error(e)) => return Err(e),
            Some(TransportEvent::Closed) | None => {
                return Err("transport closed before opening".to_string());
            }
            Some(TransportEvent::Message(_)) => {}
        }
    }
}

/// Handle to an open subscription on one relay.
///
/// Dropping the handle does not close the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    relay_url: String,
    connection: Weak<Inner>,
    closed: AtomicBool,
}

impl Subscription {
    /// The subscription id sent to the relay.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The relay the subscription lives on.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Sends CLOSE and stops delivering events. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.unsubscribe(&self.id);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").field("url", &self.url).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::relay::subscription::SubscriptionHandlers;
    use crate::relay::testing::{MockBehavior, MockConnector};
    use nostr::{EventBuilder, Keys};
    use serde_json::json;

    const URL: &str = "ws://relay.example.onion";

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_connect_timeout(Duration::from_millis(100))
            .with_publish_timeout(Duration::from_millis(100))
    }

    fn note(content: &str) -> Event {
        EventBuilder::text_note(content)
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    fn connection(connector: &Arc<MockConnector>) -> RelayConnection {
        let endpoint = RelayEndpoint::parse(URL).unwrap();
        RelayConnection::new(endpoint, Arc::clone(connector) as Arc<dyn Connector>, &config())
    }

    fn counting_handlers() -> (Arc<SubscriptionHandlers>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let events = Arc::new(AtomicUsize::new(0));
        let eose = Arc::new(AtomicUsize::new(0));
        let (e, o) = (Arc::clone(&events), Arc::clone(&eose));
        let handlers = SubscriptionHandlers::new()
            .with_event(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .with_eose(move || {
                o.fetch_add(1, Ordering::SeqCst);
            });
        (Arc::new(handlers), events, eose)
    }

    #[test]
    fn new_connection_is_disconnected() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);

        assert_eq!(relay.status(), RelayStatus::Disconnected);
        assert_eq!(relay.url(), URL);
        assert!(relay.endpoint().requires_anonymity());
    }

    #[tokio::test]
    async fn connect_succeeds_on_open() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        let mut notifications = relay.notifications();

        relay.connect().await.unwrap();

        assert!(relay.is_connected());
        assert_eq!(notifications.recv().await.unwrap(), RelayNotification::Connected);
        // second connect is a no-op
        relay.connect().await.unwrap();
        assert_eq!(connector.open_count(URL), 1);
    }

    #[tokio::test]
    async fn connect_fails_on_transport_error() {
        let connector = Arc::new(
            MockConnector::new().with_behavior(URL, MockBehavior::Fail("refused".to_string())),
        );
        let relay = connection(&connector);

        let result = relay.connect().await;

        assert_eq!(
            result,
            Err(RelayError::Connection {
                url: URL.to_string(),
                reason: "refused".to_string(),
            })
        );
        assert_eq!(relay.status(), RelayStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_times_out() {
        let connector = Arc::new(MockConnector::new().with_behavior(URL, MockBehavior::Hang));
        let relay = connection(&connector);

        let result = relay.connect().await;

        assert!(matches!(result, Err(RelayError::ConnectTimeout { .. })));
        assert_eq!(relay.status(), RelayStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_after_close_fails() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.close();

        assert!(matches!(relay.connect().await, Err(RelayError::Closed { .. })));
        assert_eq!(connector.open_count(URL), 0);
    }

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        let (handlers, _, _) = counting_handlers();

        let result = relay.subscribe(vec![json!({"kinds": [1]})], handlers);

        assert!(matches!(result, Err(RelayError::NotConnected { .. })));
        assert_eq!(relay.subscription_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_sends_filters_verbatim() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut mock = connector.take_relay(URL).unwrap();
        let (handlers, _, _) = counting_handlers();

        let filters = vec![
            json!({"kinds": [1], "limit": 5}),
            json!({"authors": ["ab"], "#t": ["nostr"]}),
        ];
        let sub = relay.subscribe(filters.clone(), handlers).unwrap();

        let frame = mock.next_frame().await.unwrap();
        assert_eq!(frame[0], "REQ");
        assert_eq!(frame[1], sub.id());
        assert_eq!(&frame[2..], filters.as_slice());
        assert_eq!(relay.subscription_count(), 1);
    }

    #[tokio::test]
    async fn events_reach_handlers_until_closed() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut mock = connector.take_relay(URL).unwrap();
        let (handlers, events, eose) = counting_handlers();

        let sub = relay.subscribe(vec![json!({})], handlers).unwrap();
        let event = note("hello");

        relay.handle_frame(&json!(["EVENT", sub.id(), event]).to_string());
        relay.handle_frame(&json!(["EOSE", sub.id()]).to_string());
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(eose.load(Ordering::SeqCst), 1);

        sub.close();
        sub.close();
        relay.handle_frame(&json!(["EVENT", sub.id(), event]).to_string());
        relay.handle_frame(&json!(["EOSE", sub.id()]).to_string());

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(eose.load(Ordering::SeqCst), 1);
        assert!(sub.is_closed());

        let _req = mock.next_frame().await.unwrap();
        let close = mock.next_frame().await.unwrap();
        assert_eq!(close, vec![json!("CLOSE"), json!(sub.id())]);
        // only one CLOSE despite two close() calls
        assert!(mock.drain_frames().is_empty());
    }

    #[tokio::test]
    async fn events_for_other_subscriptions_are_ignored() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let (handlers, events, _) = counting_handlers();

        let _sub = relay.subscribe(vec![json!({})], handlers).unwrap();
        relay.handle_frame(&json!(["EVENT", "someone-else", note("x")]).to_string());

        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_change_nothing() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let (handlers, events, _) = counting_handlers();
        let _sub = relay.subscribe(vec![json!({})], handlers).unwrap();

        for frame in ["not json", "{}", "[]", r#"["AUTH","challenge"]"#, r#"["OK","zz",true,""]"#] {
            relay.handle_frame(frame);
        }

        assert!(relay.is_connected());
        assert_eq!(relay.subscription_count(), 1);
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);

        let result = relay.publish(&note("x")).await;

        assert!(matches!(result, Err(RelayError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn publish_resolves_on_ok_true() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut mock = connector.take_relay(URL).unwrap();
        let event = note("publish me");

        let ack = async {
            let frame = mock.next_frame().await.unwrap();
            assert_eq!(frame[0], "EVENT");
            assert_eq!(frame[1]["id"], event.id.to_hex());
            mock.send(json!(["OK", event.id.to_hex(), true, ""]).to_string());
        };
        let (result, ()) = tokio::join!(relay.publish(&event), ack);

        assert_eq!(result, Ok(()));
        assert_eq!(relay.pending_publish_count(), 0);
    }

    #[tokio::test]
    async fn publish_rejects_with_relay_message() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut mock = connector.take_relay(URL).unwrap();
        let event = note("spam");

        let ack = async {
            mock.next_frame().await.unwrap();
            mock.send(json!(["OK", event.id.to_hex(), false, "blocked: spam"]).to_string());
        };
        let (result, ()) = tokio::join!(relay.publish(&event), ack);

        assert_eq!(
            result,
            Err(RelayError::Rejected {
                relay: URL.to_string(),
                reason: "blocked: spam".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn publish_times_out_and_ignores_late_ok() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let event = note("slow");

        let result = relay.publish(&event).await;

        assert_eq!(
            result,
            Err(RelayError::PublishTimeout {
                event_id: event.id.to_hex(),
            })
        );
        assert_eq!(relay.pending_publish_count(), 0);

        relay.handle_frame(&json!(["OK", event.id.to_hex(), true, ""]).to_string());
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn same_event_published_twice_settles_both_on_first_ok() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut mock = connector.take_relay(URL).unwrap();
        let event = note("dup");

        let ack = async {
            mock.next_frame().await.unwrap();
            mock.next_frame().await.unwrap();
            mock.send(json!(["OK", event.id.to_hex(), true, ""]).to_string());
            mock.send(json!(["OK", event.id.to_hex(), false, "duplicate"]).to_string());
        };
        let (first, second, ()) = tokio::join!(relay.publish(&event), relay.publish(&event), ack);

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
    }

    #[tokio::test]
    async fn transport_close_rejects_pending_and_drops_subscriptions() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut notifications = relay.notifications();
        let mut mock = connector.take_relay(URL).unwrap();
        let (handlers, _, _) = counting_handlers();
        let _sub = relay.subscribe(vec![json!({})], handlers).unwrap();
        let event = note("lost");

        let drop_link = async {
            mock.next_frame().await.unwrap();
            mock.next_frame().await.unwrap();
            mock.close();
        };
        let (result, ()) = tokio::join!(relay.publish(&event), drop_link);

        assert_eq!(
            result,
            Err(RelayError::ConnectionLost {
                url: URL.to_string(),
            })
        );
        assert_eq!(relay.status(), RelayStatus::Disconnected);
        assert_eq!(relay.subscription_count(), 0);
        assert_eq!(notifications.recv().await.unwrap(), RelayNotification::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_after_remote_close() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut notifications = relay.notifications();
        connector.take_relay(URL).unwrap().close();
        assert_eq!(notifications.recv().await.unwrap(), RelayNotification::Disconnected);

        relay.connect().await.unwrap();

        assert!(relay.is_connected());
        assert_eq!(connector.open_count(URL), 2);
    }

    #[tokio::test]
    async fn notice_is_forwarded() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let mut notifications = relay.notifications();

        relay.handle_frame(r#"["NOTICE","rate limited"]"#);

        assert_eq!(
            notifications.recv().await.unwrap(),
            RelayNotification::Notice("rate limited".to_string())
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_pending() {
        let connector = Arc::new(MockConnector::new());
        let relay = Arc::new(connection(&connector));
        relay.connect().await.unwrap();
        let event = note("abandoned");

        let publisher = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.publish(&event).await })
        };
        while relay.pending_publish_count() == 0 {
            tokio::task::yield_now().await;
        }

        relay.close();
        relay.close();

        assert!(matches!(
            publisher.await.unwrap(),
            Err(RelayError::ConnectionLost { .. })
        ));
        assert_eq!(relay.status(), RelayStatus::Closed);
    }

    #[tokio::test]
    async fn subscription_close_after_connection_close_is_noop() {
        let connector = Arc::new(MockConnector::new());
        let relay = connection(&connector);
        relay.connect().await.unwrap();
        let (handlers, _, _) = counting_handlers();
        let sub = relay.subscribe(vec![json!({})], handlers).unwrap();

        relay.close();
        sub.close();

        assert!(sub.is_closed());
        assert_eq!(relay.subscription_count(), 0);
    }
}
