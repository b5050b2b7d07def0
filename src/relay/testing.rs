//! In-memory transport for tests.
//!
//! [`MockConnector`] hands out channel pairs instead of sockets. Each URL
//! can be scripted to open, fail, hang or auto-acknowledge publishes, and
//! tests can take the far side of an opened transport as a [`MockRelay`]
//! to read outbound frames and inject inbound ones.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::transport::{channel_pair, Connector, TransportChannel, TransportCommand, TransportEvent, TransportPeer};
use super::types::RelayEndpoint;

/// How a [`MockConnector`] answers `open` for a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Opens at once; the peer is kept for [`MockConnector::take_relay`].
    Open,
    /// Opens at once and answers every EVENT frame with an OK frame.
    AutoAck {
        /// Value of the OK frame's accepted flag.
        accepted: bool,
        /// Message of the OK frame.
        message: String,
    },
    /// Reports an error and closes without opening.
    Fail(String),
    /// Never opens. The peer is kept so the channel stays alive.
    Hang,
}

/// Scriptable [`Connector`].
#[derive(Debug)]
pub struct MockConnector {
    fallback: MockBehavior,
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    relays: Mutex<HashMap<String, MockRelay>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// A connector that opens every URL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fallback(MockBehavior::Open)
    }

    /// A connector that applies `fallback` to unscripted URLs.
    #[must_use]
    pub fn with_fallback(fallback: MockBehavior) -> Self {
        Self {
            fallback,
            behaviors: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
        }
    }

    /// Scripts `url`.
    #[must_use]
    pub fn with_behavior(self, url: &str, behavior: MockBehavior) -> Self {
        self.set_behavior(url, behavior);
        self
    }

    /// Re-scripts `url` for later opens.
    pub fn set_behavior(&self, url: &str, behavior: MockBehavior) {
        self.behaviors.lock().insert(url.to_string(), behavior);
    }

    /// How many times `url` was opened.
    #[must_use]
    pub fn open_count(&self, url: &str) -> usize {
        self.opens.lock().get(url).copied().unwrap_or(0)
    }

    /// Total number of opens across all URLs.
    #[must_use]
    pub fn total_opens(&self) -> usize {
        self.opens.lock().values().sum()
    }

    /// Takes the far side of the latest transport opened for `url`.
    #[must_use]
    pub fn take_relay(&self, url: &str) -> Option<MockRelay> {
        self.relays.lock().remove(url)
    }
}

impl Connector for MockConnector {
    fn open(&self, endpoint: &RelayEndpoint) -> TransportChannel {
        let url = endpoint.as_str().to_string();
        let (channel, peer) = channel_pair();

        *self.opens.lock().entry(url.clone()).or_default() += 1;
        let behavior = self
            .behaviors
            .lock()
            .get(&url)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        match behavior {
            MockBehavior::Open => {
                peer.emit(TransportEvent::Opened);
                self.relays.lock().insert(url, MockRelay { peer });
            }
            MockBehavior::Hang => {
                self.relays.lock().insert(url, MockRelay { peer });
            }
            MockBehavior::Fail(reason) => {
                peer.emit(TransportEvent::Error(reason));
                peer.emit(TransportEvent::Closed);
            }
            MockBehavior::AutoAck { accepted, message } => {
                peer.emit(TransportEvent::Opened);
                tokio::spawn(auto_ack(peer, accepted, message));
            }
        }

        channel
    }
}

async fn auto_ack(mut peer: TransportPeer, accepted: bool, message: String) {
    while let Some(command) = peer.commands.recv().await {
        let text = match command {
            TransportCommand::Send(text) => text,
            TransportCommand::Close => break,
        };
        let Ok(frame) = serde_json::from_str::<Vec<Value>>(&text) else {
            continue;
        };
        if frame.first().and_then(Value::as_str) != Some("EVENT") {
            continue;
        }
        if let Some(id) = frame.get(1).and_then(|e| e.get("id")) {
            let ok = json!(["OK", id, accepted, message]).to_string();
            if !peer.emit(TransportEvent::Message(ok)) {
                return;
            }
        }
    }
    peer.emit(TransportEvent::Closed);
}

/// The relay side of a mock transport.
#[derive(Debug)]
pub struct MockRelay {
    peer: TransportPeer,
}

impl MockRelay {
    /// Delivers a text frame to the connection.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.peer.emit(TransportEvent::Message(frame.into()))
    }

    /// Reports a transport error.
    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.peer.emit(TransportEvent::Error(reason.into()))
    }

    /// Closes the transport from the relay side.
    pub fn close(&self) {
        self.peer.emit(TransportEvent::Closed);
    }

    /// Waits for the next outbound frame, parsed as a JSON array.
    ///
    /// Returns `None` once the connection closes the transport.
    pub async fn next_frame(&mut self) -> Option<Vec<Value>> {
        loop {
            match self.peer.commands.recv().await? {
                TransportCommand::Send(text) => {
                    if let Ok(frame) = serde_json::from_str(&text) {
                        return Some(frame);
                    }
                }
                TransportCommand::Close => return None,
            }
        }
    }

    /// Returns the outbound frames queued so far without waiting.
    pub fn drain_frames(&mut self) -> Vec<Vec<Value>> {
        let mut frames = Vec::new();
        while let Ok(command) = self.peer.commands.try_recv() {
            if let TransportCommand::Send(text) = command {
                if let Ok(frame) = serde_json::from_str(&text) {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    /// Whether the connection has asked to close the transport.
    pub fn close_requested(&mut self) -> bool {
        while let Ok(command) = self.peer.commands.try_recv() {
            if command == TransportCommand::Close {
                return true;
            }
        }
        false
    }
}
