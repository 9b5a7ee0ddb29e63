//! Session transport boundary and outbound message encoding
//!
//! The distributor only knows a session as something it can hand a JSON
//! string to. `ChannelTransport` is the production implementation: a
//! bounded mpsc feeding the session's socket writer task.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use types::errors::TransportError;
use types::event::{Category, Event, EventPayload};
use types::ids::Symbol;
use types::time::nanos_to_millis;

/// Write side of one subscriber session.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Deliver one already-encoded message.
    async fn send(&self, payload: &str) -> Result<(), TransportError>;
}

/// Transport backed by a bounded channel to a writer task.
///
/// Never waits: a full channel means the socket writer is behind, which is
/// reported as backpressure and treated by the distributor as a failure.
pub struct ChannelTransport {
    tx: mpsc::Sender<String>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer task consumes.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.tx.try_send(payload.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[derive(Serialize)]
struct WireEvent<'a> {
    category: Category,
    symbol: &'a Symbol,
    data: &'a EventPayload,
}

#[derive(Serialize)]
struct EventBatch<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    /// Unix milliseconds
    timestamp: i64,
    events: Vec<WireEvent<'a>>,
}

/// Encode one `event_batch` message; an empty slice encodes a heartbeat.
pub fn encode_event_batch(now_nanos: i64, events: &[&Event]) -> Result<String, TransportError> {
    let batch = EventBatch {
        kind: "event_batch",
        timestamp: nanos_to_millis(now_nanos),
        events: events
            .iter()
            .map(|event| WireEvent {
                category: event.category(),
                symbol: &event.symbol,
                data: &event.payload,
            })
            .collect(),
    };
    serde_json::to_string(&batch).map_err(|e| TransportError::Encode(e.to_string()))
}
