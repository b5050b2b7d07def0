//! Multi-relay pool.
//!
//! The pool owns one [`RelayConnection`] per relay, fans subscribe,
//! publish and disconnect out to all of them, and reports per-relay
//! outcomes instead of failing as a whole.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use nostr::Event;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{RelayConnection, RelayNotification, Subscription};
use super::subscription::{generate_subscription_id, PoolSubscriptionHandler, RelayTagged};
use super::transport::Transports;
use super::types::{ConnectSummary, PoolResult, RelayEndpoint};
use crate::config::ClientConfig;

/// Capacity of the pool notification channel.
const NOTIFICATION_CAPACITY: usize = 256;

/// A connection notification tagged with its relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolNotification {
    /// The relay that emitted the notification.
    pub relay_url: String,
    /// The notification.
    pub notification: RelayNotification,
}

/// Result of [`RelayPool::subscribe_all`].
#[derive(Debug, Clone)]
pub struct PoolSubscription {
    /// Logical subscription id, used with [`RelayPool::close_subscription`].
    pub id: String,
    /// Per-relay outcomes.
    pub results: Vec<PoolResult>,
}

impl PoolSubscription {
    /// Number of relays the subscription is open on.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Pool of relay connections.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use nostr_tor_client::{ClientConfig, relay::RelayPool};
///
/// let config = ClientConfig::default();
/// let pool = RelayPool::new(config.clone());
///
/// let summary = pool.connect_all(&config.default_relays).await;
/// println!("{summary}");
///
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
/// let sub = pool.subscribe_all(config.default_filters.clone(), Arc::new(tx)).await;
/// while let Some(event) = rx.recv().await {
///     // ...
/// }
/// pool.close_subscription(&sub.id).await;
/// pool.disconnect_all().await;
/// ```
pub struct RelayPool {
    config: ClientConfig,
    transports: Transports,

    /// Live set, keyed by relay URL.
    relays: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,

    /// Per-relay handles of every logical subscription.
    subscriptions: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,

    notifications: broadcast::Sender<PoolNotification>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayPool {
    /// Creates a pool using WebSocket transports, with `.onion` relays
    /// routed through the configured proxy.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let transports = Transports::websocket(&config.proxy);
        Self::with_transports(config, transports)
    }

    /// Creates a pool with custom transports.
    #[must_use]
    pub fn with_transports(config: ClientConfig, transports: Transports) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            transports,
            relays: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            notifications,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// The pool configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to every URL concurrently.
    ///
    /// Invalid URLs and failed connects are reported in the summary and
    /// left out of the live set. Relays already in the live set are
    /// reconnected if needed rather than duplicated. URLs naming the same
    /// relay are attempted and counted once.
    pub async fn connect_all(&self, urls: &[String]) -> ConnectSummary {
        let mut results = Vec::with_capacity(urls.len());
        let mut attempts = Vec::new();
        let mut seen = Vec::new();

        for raw in urls {
            let endpoint = match RelayEndpoint::parse(raw) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("Skipping relay {raw}: {e}");
                    results.push(PoolResult::failed(raw.as_str(), &e));
                    continue;
                }
            };

            let url = endpoint.as_str().to_string();
            if seen.contains(&url) {
                debug!("Ignoring duplicate relay {raw}");
                continue;
            }
            seen.push(url.clone());

            let existing = self.relays.read().await.get(&url).cloned();
            let connection = existing.unwrap_or_else(|| {
                let connector = self.transports.for_endpoint(&endpoint);
                Arc::new(RelayConnection::new(endpoint, connector, &self.config))
            });
            attempts.push(connection);
        }

        let outcomes = join_all(attempts.into_iter().map(|connection| async move {
            let receiver = connection.notifications();
            let outcome = connection.connect().await;
            (connection, receiver, outcome)
        }))
        .await;

        let mut connected = 0;
        for (connection, receiver, outcome) in outcomes {
            let url = connection.url().to_string();
            match outcome {
                Ok(()) => {
                    connected += 1;
                    results.push(PoolResult::ok(url.as_str()));

                    let mut relays = self.relays.write().await;
                    if !relays.contains_key(&url) {
                        self.forward_notifications(url.clone(), receiver);
                        relays.insert(url, connection);
                    }
                }
                Err(e) => results.push(PoolResult::failed(url, &e)),
            }
        }

        let summary = ConnectSummary {
            requested: results.len(),
            connected,
            results,
        };
        info!("Connected to {}/{} relays", summary.connected, summary.requested);
        summary
    }

    fn forward_notifications(&self, relay_url: String, mut receiver: broadcast::Receiver<RelayNotification>) {
        let sender = self.notifications.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        let _ = sender.send(PoolNotification {
                            relay_url: relay_url.clone(),
                            notification,
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {skipped} notifications from {relay_url}");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.lock().push(handle);
    }

    /// Subscribes on every relay in the live set with the same filters.
    ///
    /// The handler receives the originating relay URL with every event and
    /// end-of-stored-events signal.
    pub async fn subscribe_all(
        &self,
        filters: Vec<Value>,
        handler: Arc<dyn PoolSubscriptionHandler>,
    ) -> PoolSubscription {
        let relays = self.snapshot().await;
        let mut subscriptions = self.subscriptions.write().await;

        let id = loop {
            let candidate = generate_subscription_id();
            if !subscriptions.contains_key(&candidate) {
                break candidate;
            }
        };

        let mut handles = Vec::new();
        let mut results = Vec::with_capacity(relays.len());

        for relay in relays {
            let tagged = Arc::new(RelayTagged {
                relay_url: relay.url().to_string(),
                subscription_id: id.clone(),
                inner: Arc::clone(&handler),
            });

            match relay.subscribe(filters.clone(), tagged) {
                Ok(subscription) => {
                    handles.push(subscription);
                    results.push(PoolResult::ok(relay.url()));
                }
                Err(e) => {
                    warn!("Failed to subscribe on {}: {}", relay.url(), e);
                    results.push(PoolResult::failed(relay.url(), &e));
                }
            }
        }

        info!("Subscription {} open on {}/{} relays", id, handles.len(), results.len());
        subscriptions.insert(id.clone(), handles);

        PoolSubscription { id, results }
    }

    /// Publishes to every relay in the live set and waits for all of them.
    pub async fn publish_all(&self, event: &Event) -> Vec<PoolResult> {
        let relays = self.snapshot().await;

        let results = join_all(relays.iter().map(|relay| async move {
            match relay.publish(event).await {
                Ok(()) => {
                    info!("Published {} to {}", event.id, relay.url());
                    PoolResult::ok(relay.url())
                }
                Err(e) => {
                    warn!("Failed to publish to {}: {}", relay.url(), e);
                    PoolResult::failed(relay.url(), &e)
                }
            }
        }))
        .await;

        let accepted = results.iter().filter(|r| r.success).count();
        info!("Event {} accepted by {}/{} relays", event.id, accepted, results.len());
        results
    }

    /// Closes a logical subscription on every relay. Unknown ids are ignored.
    pub async fn close_subscription(&self, id: &str) {
        let Some(handles) = self.subscriptions.write().await.remove(id) else {
            return;
        };
        for handle in &handles {
            handle.close();
        }
        info!("Closed subscription {}", id);
    }

    /// Closes all subscriptions and connections. Safe to call repeatedly.
    pub async fn disconnect_all(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .write()
            .await
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        for subscription in &subscriptions {
            subscription.close();
        }

        let relays: Vec<Arc<RelayConnection>> =
            self.relays.write().await.drain().map(|(_, relay)| relay).collect();
        for relay in &relays {
            relay.close();
        }

        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }

        if !relays.is_empty() {
            info!("Disconnected from {} relays", relays.len());
        }
    }

    /// URLs of the live set.
    pub async fn relay_urls(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }

    /// Number of relays in the live set that are currently connected.
    pub async fn connected_count(&self) -> usize {
        self.relays
            .read()
            .await
            .values()
            .filter(|relay| relay.is_connected())
            .count()
    }

    /// Whether `url` is in the live set and connected.
    pub async fn is_connected(&self, url: &str) -> bool {
        self.relays
            .read()
            .await
            .get(&relay_key(url))
            .is_some_and(|relay| relay.is_connected())
    }

    /// The connection for `url`, if it is in the live set.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.relays.read().await.get(&relay_key(url)).cloned()
    }

    /// Ids of the open logical subscriptions.
    pub async fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    /// Receives notifications from every relay in the live set.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<PoolNotification> {
        self.notifications.subscribe()
    }

    async fn snapshot(&self) -> Vec<Arc<RelayConnection>> {
        self.relays.read().await.values().cloned().collect()
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        for forwarder in self.forwarders.get_mut().drain(..) {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Live-set key for `url`: the parsed form when it parses, else `url` as is.
fn relay_key(url: &str) -> String {
    RelayEndpoint::parse(url).map_or_else(|_| url.to_string(), |e| e.as_str().to_string())
}
