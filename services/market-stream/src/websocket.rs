//! WebSocket adapter for subscriber sessions
//!
//! One `/ws` route. On upgrade a session is registered with a match-all
//! filter and a [`ChannelTransport`]; the socket is then split into:
//!
//! - a writer task forwarding distributor batches (and filter replies) to
//!   the socket, closing it once the registry drops the session,
//! - the read loop, which refreshes liveness on every inbound frame and
//!   applies filter messages.
//!
//! Filter message format:
//! `{"action": "subscribe" | "unsubscribe" | "set", "symbols": [...], "categories": [...]}`
//!
//! The session is unregistered when either half ends.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::sink::{Sink, SinkExt};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::event::Category;
use types::ids::{SessionId, Symbol};
use types::time::now_nanos;

use crate::subscriptions::{SubscriptionFilter, SubscriptionRegistry};
use crate::transport::ChannelTransport;

/// Replies to filter messages are few; a small side channel is enough.
const CONTROL_CAPACITY: usize = 8;

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<SubscriptionRegistry>,
    /// Outbound batches a session may have queued before it counts as slow.
    pub outbound_capacity: usize,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Add to the current filter
    Subscribe,
    /// Remove from the current filter
    Unsubscribe,
    /// Replace the current filter
    Set,
}

/// Client filter request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilterMessage {
    pub action: FilterAction,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl FilterMessage {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The filter that results from applying this message to `current`.
    ///
    /// Empty sets mean "everything", so unsubscribing the last symbol widens
    /// the session back to all symbols.
    pub fn apply(&self, current: &SubscriptionFilter) -> SubscriptionFilter {
        let symbols: BTreeSet<Symbol> = self.symbols.iter().cloned().collect();
        let categories: BTreeSet<Category> = self.categories.iter().copied().collect();

        match self.action {
            FilterAction::Set => SubscriptionFilter { symbols, categories },
            FilterAction::Subscribe => SubscriptionFilter {
                symbols: current.symbols.union(&symbols).cloned().collect(),
                categories: current.categories.union(&categories).copied().collect(),
            },
            FilterAction::Unsubscribe => SubscriptionFilter {
                symbols: current.symbols.difference(&symbols).cloned().collect(),
                categories: current.categories.difference(&categories).copied().collect(),
            },
        }
    }
}

/// Server reply to a filter message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterReply {
    FilterAck {
        symbols: Vec<Symbol>,
        categories: Vec<Category>,
    },
    Error {
        message: String,
    },
}

impl FilterReply {
    fn ack(filter: &SubscriptionFilter) -> Self {
        FilterReply::FilterAck {
            symbols: filter.symbols.iter().cloned().collect(),
            categories: filter.categories.iter().copied().collect(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        FilterReply::Error {
            message: message.into(),
        }
    }
}

/// Apply one inbound text frame to the session's filter.
pub fn handle_filter_text(registry: &SubscriptionRegistry, session_id: SessionId, text: &str) -> FilterReply {
    let message = match FilterMessage::parse(text) {
        Ok(message) => message,
        Err(err) => return FilterReply::error(format!("invalid filter message: {err}")),
    };
    let Some(current) = registry.get(session_id) else {
        return FilterReply::error("session not registered");
    };

    let filter = message.apply(&current.filter);
    match registry.update_filter(session_id, filter.clone()) {
        Ok(()) => FilterReply::ack(&filter),
        Err(err) => FilterReply::error(err.to_string()),
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Writer half of a session: forwards batches and filter replies to `sink`.
///
/// Returns once the batch channel closes, which happens when the registry
/// drops the session's transport, or when the socket refuses a frame. The
/// socket is closed on the way out.
pub async fn forward_outbound<S>(mut sink: S, mut batches: mpsc::Receiver<String>, mut control: mpsc::Receiver<String>)
where
    S: Sink<Message> + Unpin,
{
    loop {
        let payload = tokio::select! {
            batch = batches.recv() => match batch {
                Some(payload) => payload,
                None => break,
            },
            Some(reply) = control.recv() => reply,
        };
        if sink.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let session_id = SessionId::new();
    let (transport, batches) = ChannelTransport::new(state.outbound_capacity);
    if let Err(err) = state
        .registry
        .register(session_id, SubscriptionFilter::all(), Arc::new(transport), now_nanos())
    {
        warn!(session_id = %session_id, error = %err, "Failed to register session");
        return;
    }

    let (sink, mut stream) = socket.split();
    let (control_tx, mut control_rx) = mpsc::channel::<String>(CONTROL_CAPACITY);

    let mut writer = tokio::spawn(forward_outbound(sink, batches, control_rx));

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut writer => break,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(session_id = %session_id, error = %err, "Socket read error");
                break;
            }
            None => break,
        };

        // Any frame counts as activity, including pings and pongs.
        if state.registry.touch(session_id, now_nanos()).is_err() {
            // Removed by the distributor (failed send or liveness sweep).
            break;
        }

        match msg {
            Message::Text(text) => {
                let reply = handle_filter_text(&state.registry, session_id, &text);
                if let FilterReply::Error { message } = &reply {
                    debug!(session_id = %session_id, error = %message, "Rejected filter message");
                }
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        if control_tx.try_send(json).is_err() {
                            warn!(session_id = %session_id, "Filter reply dropped, control channel full");
                        }
                    }
                    Err(err) => warn!(session_id = %session_id, error = %err, "Failed to encode filter reply"),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.registry.unregister(session_id);
    info!(session_id = %session_id, "Session closed");
}
