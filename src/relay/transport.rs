//! Duplex message transport used by relay connections.
//!
//! A transport is a pair of channels: a [`TransportSender`] carrying
//! outbound commands and a receiver of [`TransportEvent`] lifecycle
//! notifications. Connection logic only ever sees this pair, so the
//! WebSocket adapter below can be swapped for an in-memory one in tests.
//!
//! # Routing
//!
//! ```text
//! RelayConnection
//!     │
//!     ▼
//! Connector ──(direct)──────────────────▶ relay (ws/wss)
//!     │
//!     └─(proxied)─▶ SOCKS5 proxy (Tor) ──▶ relay (.onion)
//! ```

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::socks;
use super::types::RelayEndpoint;
use crate::config::ProxyConfig;

/// Lifecycle notifications delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is open and ready to carry frames.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The channel closed. No further events follow.
    Closed,
    /// The channel reported an error.
    Error(String),
}

/// Commands accepted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Send a text frame.
    Send(String),
    /// Close the channel.
    Close,
}

/// The outbound half of a transport channel.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportSender {
    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// Returns the frame back if the transport has shut down.
    pub fn send(&self, text: String) -> Result<(), String> {
        self.tx
            .send(TransportCommand::Send(text))
            .map_err(|e| match e.0 {
                TransportCommand::Send(text) => text,
                TransportCommand::Close => String::new(),
            })
    }

    /// Asks the transport to close. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.tx.send(TransportCommand::Close);
    }
}

/// Both halves of an opened transport, as seen by the connection.
#[derive(Debug)]
pub struct TransportChannel {
    /// Outbound commands.
    pub sender: TransportSender,
    /// Inbound notifications.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The far side of a [`TransportChannel`], driven by a transport task.
#[derive(Debug)]
pub struct TransportPeer {
    /// Commands issued by the connection.
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    /// Notifications for the connection.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportPeer {
    /// Delivers a notification. Returns false once the connection is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Creates a connected channel/peer pair.
#[must_use]
pub fn channel_pair() -> (TransportChannel, TransportPeer) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    (
        TransportChannel {
            sender: TransportSender { tx: command_tx },
            events: event_rx,
        },
        TransportPeer {
            commands: command_rx,
            events: event_tx,
        },
    )
}

/// Opens transports to relay endpoints.
///
/// `open` must not block: it returns immediately and reports progress
/// through the channel's notifications.
pub trait Connector: Send + Sync {
    /// Starts opening a transport to `endpoint`.
    fn open(&self, endpoint: &RelayEndpoint) -> TransportChannel;
}

/// WebSocket transport, optionally tunnelled through a SOCKS5 proxy.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    proxy: Option<ProxyConfig>,
}

impl WebSocketConnector {
    /// A connector that dials relays directly.
    #[must_use]
    pub const fn direct() -> Self {
        Self { proxy: None }
    }

    /// A connector that reaches relays through the given proxy.
    #[must_use]
    pub const fn proxied(proxy: ProxyConfig) -> Self {
        Self { proxy: Some(proxy) }
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, endpoint: &RelayEndpoint) -> TransportChannel {
        let (channel, peer) = channel_pair();
        let url = endpoint.url().clone();
        let proxy = self.proxy.clone();

        tokio::spawn(async move {
            run_websocket(url, proxy, peer).await;
        });

        channel
    }
}

/// The pair of connectors a pool chooses from per endpoint.
#[derive(Clone)]
pub struct Transports {
    direct: Arc<dyn Connector>,
    anonymized: Arc<dyn Connector>,
}

impl Transports {
    /// Builds the production transports: direct WebSocket, and WebSocket
    /// through the configured proxy.
    #[must_use]
    pub fn websocket(proxy: &ProxyConfig) -> Self {
        Self {
            direct: Arc::new(WebSocketConnector::direct()),
            anonymized: Arc::new(WebSocketConnector::proxied(proxy.clone())),
        }
    }

    /// Uses the same connector for every endpoint.
    #[must_use]
    pub fn uniform(connector: Arc<dyn Connector>) -> Self {
        Self {
            direct: Arc::clone(&connector),
            anonymized: connector,
        }
    }

    /// Uses separate connectors for direct and anonymized endpoints.
    #[must_use]
    pub fn new(direct: Arc<dyn Connector>, anonymized: Arc<dyn Connector>) -> Self {
        Self { direct, anonymized }
    }

    /// The connector that must be used for `endpoint`.
    #[must_use]
    pub fn for_endpoint(&self, endpoint: &RelayEndpoint) -> Arc<dyn Connector> {
        if endpoint.requires_anonymity() {
            Arc::clone(&self.anonymized)
        } else {
            Arc::clone(&self.direct)
        }
    }
}

async fn run_websocket(url: Url, proxy: Option<ProxyConfig>, mut peer: TransportPeer) {
    let Some(host) = url.host_str().map(str::to_owned) else {
        peer.emit(TransportEvent::Error(format!("{url}: missing host")));
        peer.emit(TransportEvent::Closed);
        return;
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let stream = match &proxy {
        Some(proxy) => {
            debug!("Dialing {host}:{port} through proxy {}", proxy.addr());
            socks::connect(proxy, &host, port)
                .await
                .map_err(|e| e.to_string())
        }
        None => TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| e.to_string()),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            peer.emit(TransportEvent::Error(e));
            peer.emit(TransportEvent::Closed);
            return;
        }
    };

    let ws = match tokio_tungstenite::client_async_tls(url.as_str(), stream).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            peer.emit(TransportEvent::Error(e.to_string()));
            peer.emit(TransportEvent::Closed);
            return;
        }
    };

    if !peer.emit(TransportEvent::Opened) {
        return;
    }

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            command = peer.commands.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        peer.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !peer.emit(TransportEvent::Message(text.as_str().to_owned())) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        peer.emit(TransportEvent::Message(text));
                    }
                    Err(_) => warn!("Dropping non-UTF-8 binary frame from {url}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                // ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    peer.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            },
        }
    }

    peer.emit(TransportEvent::Closed);
}
