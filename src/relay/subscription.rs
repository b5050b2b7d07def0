//! Subscription handlers and id generation.
//!
//! A relay connection delivers events for a subscription to a
//! [`SubscriptionHandler`]. The pool wraps the caller's
//! [`PoolSubscriptionHandler`] so every callback also carries the URL of
//! the relay it came from.

use std::fmt;

use nostr::Event;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

/// Length of generated subscription ids.
const SUBSCRIPTION_ID_LEN: usize = 9;

/// Receives the events of one subscription on one relay.
pub trait SubscriptionHandler: Send + Sync {
    /// Called for every EVENT frame of the subscription.
    fn on_event(&self, event: Event);

    /// Called when the relay signals end of stored events.
    fn on_eose(&self) {}
}

type EventFn = Box<dyn Fn(Event) + Send + Sync>;
type EoseFn = Box<dyn Fn() + Send + Sync>;

/// Closure-based [`SubscriptionHandler`].
///
/// ```
/// use nostr_tor_client::relay::SubscriptionHandlers;
///
/// let handlers = SubscriptionHandlers::new()
///     .with_event(|event| println!("{}", event.id))
///     .with_eose(|| println!("caught up"));
/// ```
#[derive(Default)]
pub struct SubscriptionHandlers {
    on_event: Option<EventFn>,
    on_eose: Option<EoseFn>,
}

impl SubscriptionHandlers {
    /// Handlers that ignore everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event callback.
    #[must_use]
    pub fn with_event(mut self, f: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Box::new(f));
        self
    }

    /// Sets the end-of-stored-events callback.
    #[must_use]
    pub fn with_eose(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_eose = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("on_event", &self.on_event.is_some())
            .field("on_eose", &self.on_eose.is_some())
            .finish()
    }
}

impl SubscriptionHandler for SubscriptionHandlers {
    fn on_event(&self, event: Event) {
        if let Some(f) = &self.on_event {
            f(event);
        }
    }

    fn on_eose(&self) {
        if let Some(f) = &self.on_eose {
            f();
        }
    }
}

/// Receives the events of a pool-wide subscription, tagged with their relay.
pub trait PoolSubscriptionHandler: Send + Sync {
    /// Called for every event any relay delivers for the subscription.
    fn on_event(&self, relay_url: &str, subscription_id: &str, event: Event);

    /// Called when one relay signals end of stored events.
    fn on_eose(&self, _relay_url: &str, _subscription_id: &str) {}
}

/// A pool subscription callback, as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// An event from a relay.
    Event {
        /// Originating relay.
        relay_url: String,
        /// Pool subscription id.
        subscription_id: String,
        /// The event.
        event: Box<Event>,
    },
    /// End of stored events from a relay.
    Eose {
        /// Originating relay.
        relay_url: String,
        /// Pool subscription id.
        subscription_id: String,
    },
}

/// Forwards pool subscription callbacks into a channel.
impl PoolSubscriptionHandler for mpsc::UnboundedSender<SubscriptionEvent> {
    fn on_event(&self, relay_url: &str, subscription_id: &str, event: Event) {
        let _ = self.send(SubscriptionEvent::Event {
            relay_url: relay_url.to_string(),
            subscription_id: subscription_id.to_string(),
            event: Box::new(event),
        });
    }

    fn on_eose(&self, relay_url: &str, subscription_id: &str) {
        let _ = self.send(SubscriptionEvent::Eose {
            relay_url: relay_url.to_string(),
            subscription_id: subscription_id.to_string(),
        });
    }
}

/// Adapts a pool handler to one relay.
pub(crate) struct RelayTagged<H: ?Sized> {
    pub(crate) relay_url: String,
    pub(crate) subscription_id: String,
    pub(crate) inner: std::sync::Arc<H>,
}

impl<H: PoolSubscriptionHandler + ?Sized> SubscriptionHandler for RelayTagged<H> {
    fn on_event(&self, event: Event) {
        self.inner
            .on_event(&self.relay_url, &self.subscription_id, event);
    }

    fn on_eose(&self) {
        self.inner.on_eose(&self.relay_url, &self.subscription_id);
    }
}

/// Generates a random subscription id.
#[must_use]
pub fn generate_subscription_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUBSCRIPTION_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use nostr::{EventBuilder, Keys};

    fn note() -> Event {
        EventBuilder::text_note("hi")
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = generate_subscription_id();
        assert_eq!(id.len(), SUBSCRIPTION_ID_LEN);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn generated_ids_rarely_collide() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_subscription_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn closure_handlers_are_invoked() {
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

        handlers.on_event(note());
        handlers.on_event(note());
        handlers.on_eose();

        assert_eq!(events.load(Ordering::SeqCst), 2);
        assert_eq!(eose.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_handlers_ignore_callbacks() {
        let handlers = SubscriptionHandlers::new();
        handlers.on_event(note());
        handlers.on_eose();
        assert!(format!("{handlers:?}").contains("on_event: false"));
    }

    #[test]
    fn relay_tagged_forwards_relay_url() {
        let (tx, mut rx) = mpsc::unbounded_channel::<SubscriptionEvent>();
        let tagged = RelayTagged {
            relay_url: "ws://a.onion".to_string(),
            subscription_id: "pool-sub".to_string(),
            inner: Arc::new(tx),
        };

        let event = note();
        tagged.on_event(event.clone());
        tagged.on_eose();

        assert_eq!(
            rx.try_recv().unwrap(),
            SubscriptionEvent::Event {
                relay_url: "ws://a.onion".to_string(),
                subscription_id: "pool-sub".to_string(),
                event: Box::new(event),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SubscriptionEvent::Eose {
                relay_url: "ws://a.onion".to_string(),
                subscription_id: "pool-sub".to_string(),
            }
        );
    }
}
