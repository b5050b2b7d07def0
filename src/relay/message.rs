//! Protocol frames exchanged with relays.
//!
//! Frames are JSON arrays whose first element is a kind tag:
//!
//! | Direction | Frame |
//! |-----------|-------|
//! | client → relay | `["REQ", <sub id>, <filter>...]` |
//! | client → relay | `["EVENT", <event>]` |
//! | client → relay | `["CLOSE", <sub id>]` |
//! | relay → client | `["EVENT", <sub id>, <event>]` |
//! | relay → client | `["EOSE", <sub id>]` |
//! | relay → client | `["NOTICE", <text>]` |
//! | relay → client | `["OK", <event id>, <bool>, <text>]` |

use nostr::{Event, EventId};
use serde_json::{json, Value};

use super::error::{RelayError, RelayResult};

/// Messages sent by the client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Open a subscription. Filters are forwarded verbatim.
    Req {
        /// Subscription id.
        subscription_id: String,
        /// Filters, in caller order.
        filters: Vec<Value>,
    },
    /// Publish an event.
    Event(Box<Event>),
    /// Close a subscription.
    Close(String),
}

impl ClientMessage {
    /// Encodes the frame as JSON text.
    #[must_use]
    pub fn to_json(&self) -> String {
        match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                frame.extend(filters.iter().cloned());
                Value::Array(frame).to_string()
            }
            Self::Event(event) => json!(["EVENT", event]).to_string(),
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]).to_string(),
        }
    }
}

/// Messages received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching a subscription.
    Event {
        /// Subscription the event belongs to.
        subscription_id: String,
        /// The event, untouched.
        event: Box<Event>,
    },
    /// End of stored events for a subscription.
    Eose(String),
    /// Human-readable relay notice.
    Notice(String),
    /// Acknowledgment of a published event.
    Ok {
        /// Id of the acknowledged event.
        event_id: EventId,
        /// Whether the relay accepted it.
        accepted: bool,
        /// Relay-supplied message.
        message: String,
    },
    /// A well-formed frame with a kind tag this client does not handle.
    Unknown(String),
}

impl RelayMessage {
    /// Decodes a relay frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Decode`] if the text is not a JSON array, the
    /// kind tag is missing, or a recognized kind has the wrong shape.
    pub fn from_json(msg: &str) -> RelayResult<Self> {
        if msg.is_empty() {
            return Err(RelayError::Decode("empty message".to_string()));
        }

        let frame: Vec<Value> =
            serde_json::from_str(msg).map_err(|e| RelayError::Decode(e.to_string()))?;

        let kind = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Decode("missing kind tag".to_string()))?;

        match kind {
            "EVENT" => {
                expect_len(&frame, 3, kind)?;
                let subscription_id = string_at(&frame, 1, "subscription id")?;
                let event: Event = serde_json::from_value(frame[2].clone())
                    .map_err(|e| RelayError::Decode(format!("invalid event: {e}")))?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "EOSE" => {
                expect_len(&frame, 2, kind)?;
                Ok(Self::Eose(string_at(&frame, 1, "subscription id")?))
            }
            "NOTICE" => {
                expect_len(&frame, 2, kind)?;
                Ok(Self::Notice(string_at(&frame, 1, "notice")?))
            }
            "OK" => {
                expect_len(&frame, 4, kind)?;
                let raw_id = string_at(&frame, 1, "event id")?;
                let event_id = EventId::from_hex(&raw_id)
                    .map_err(|e| RelayError::Decode(format!("invalid event id {raw_id}: {e}")))?;
                let accepted = frame[2]
                    .as_bool()
                    .ok_or_else(|| RelayError::Decode("OK status is not a boolean".to_string()))?;
                let message = string_at(&frame, 3, "message")?;
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

fn expect_len(frame: &[Value], len: usize, kind: &str) -> RelayResult<()> {
    if frame.len() == len {
        Ok(())
    } else {
        Err(RelayError::Decode(format!(
            "{kind} frame has {} elements, expected {len}",
            frame.len()
        )))
    }
}

fn string_at(frame: &[Value], index: usize, what: &str) -> RelayResult<String> {
    frame[index]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| RelayError::Decode(format!("{what} is not a string")))
}
