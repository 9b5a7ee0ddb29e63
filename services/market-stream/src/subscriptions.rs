//! Subscription registry
//!
//! Maps each connected session to its filter, liveness state and transport.
//! Writers (socket handlers) and the distributor touch disjoint entries
//! concurrently; the distributor works from a point-in-time `snapshot()`
//! so filter changes made mid-cycle apply from the next cycle.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use types::errors::RegistryError;
use types::event::{Category, Event};
use types::ids::{SessionId, Symbol};

use crate::config::StreamConfig;
use crate::metrics::ServiceMetrics;
use crate::transport::SessionTransport;

/// What a session wants to receive. An empty set means "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub symbols: BTreeSet<Symbol>,
    pub categories: BTreeSet<Category>,
}

impl SubscriptionFilter {
    /// Match every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            categories: BTreeSet::new(),
        }
    }

    pub fn with_categories<I>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = Category>,
    {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        (self.symbols.is_empty() || self.symbols.contains(&event.symbol))
            && (self.categories.is_empty() || self.categories.contains(&event.category()))
    }
}

/// Point-in-time copy of one registry entry.
#[derive(Clone)]
pub struct Subscription {
    pub session_id: SessionId,
    pub filter: SubscriptionFilter,
    /// Last inbound activity or successful emit, Unix nanos
    pub last_seen: i64,
    pub connected_at: i64,
    /// Last successful emit, Unix nanos
    pub last_emit_at: Option<i64>,
    pub batches_sent: u64,
    pub events_sent: u64,
    pub transport: Arc<dyn SessionTransport>,
}

impl Subscription {
    pub fn is_stale(&self, now: i64, timeout_nanos: i64) -> bool {
        now.saturating_sub(self.last_seen) > timeout_nanos
    }

    /// Whether a heartbeat is due given the time of the last emit (or connect).
    pub fn needs_heartbeat(&self, now: i64, interval_nanos: i64) -> bool {
        let since = self.last_emit_at.unwrap_or(self.connected_at);
        now.saturating_sub(since) >= interval_nanos
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("filter", &self.filter)
            .field("last_seen", &self.last_seen)
            .field("connected_at", &self.connected_at)
            .field("last_emit_at", &self.last_emit_at)
            .field("batches_sent", &self.batches_sent)
            .field("events_sent", &self.events_sent)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sessions idle for longer than this are removed (default: 60s).
    pub liveness_timeout_nanos: i64,
    pub max_symbols_per_session: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_nanos: 60 * 1_000_000_000,
            max_symbols_per_session: 500,
        }
    }
}

impl From<&StreamConfig> for RegistryConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            liveness_timeout_nanos: i64::try_from(config.liveness_timeout.as_nanos()).unwrap_or(i64::MAX),
            max_symbols_per_session: config.max_symbols_per_session,
        }
    }
}

/// Concurrent session registry.
pub struct SubscriptionRegistry {
    sessions: DashMap<SessionId, Subscription>,
    config: RegistryConfig,
    metrics: Arc<ServiceMetrics>,
}

impl SubscriptionRegistry {
    pub fn new(config: RegistryConfig, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            metrics,
        }
    }

    pub fn register(
        &self,
        session_id: SessionId,
        filter: SubscriptionFilter,
        transport: Arc<dyn SessionTransport>,
        now: i64,
    ) -> Result<(), RegistryError> {
        self.check_filter(&filter)?;

        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered {
                session_id: session_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Subscription {
                    session_id,
                    filter,
                    last_seen: now,
                    connected_at: now,
                    last_emit_at: None,
                    batches_sent: 0,
                    events_sent: 0,
                    transport,
                });
                self.metrics.record_session_registered();
                info!(session_id = %session_id, sessions = self.sessions.len(), "Session registered");
                Ok(())
            }
        }
    }

    /// Replace a session's filter; takes effect from the next cycle.
    pub fn update_filter(&self, session_id: SessionId, filter: SubscriptionFilter) -> Result<(), RegistryError> {
        self.check_filter(&filter)?;
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        debug!(
            session_id = %session_id,
            symbols = filter.symbols.len(),
            categories = filter.categories.len(),
            "Filter updated"
        );
        entry.filter = filter;
        Ok(())
    }

    /// Remove a session. Returns its final state, if it was registered.
    pub fn unregister(&self, session_id: SessionId) -> Option<Subscription> {
        let removed = self.sessions.remove(&session_id).map(|(_, sub)| sub);
        if removed.is_some() {
            info!(session_id = %session_id, sessions = self.sessions.len(), "Session unregistered");
        }
        removed
    }

    /// Record inbound activity from a session.
    pub fn touch(&self, session_id: SessionId, now: i64) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        entry.last_seen = entry.last_seen.max(now);
        Ok(())
    }

    /// Record a successful emit. A session removed mid-cycle is ignored.
    pub fn record_emit(&self, session_id: SessionId, now: i64, events: usize) {
        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.last_seen = entry.last_seen.max(now);
            entry.last_emit_at = Some(now);
            entry.batches_sent += 1;
            entry.events_sent += events as u64;
        }
    }

    /// Unregister every session idle past the liveness timeout.
    pub fn remove_stale(&self, now: i64) -> Vec<SessionId> {
        let timeout = self.config.liveness_timeout_nanos;
        let mut removed = Vec::new();
        self.sessions.retain(|id, sub| {
            let stale = sub.is_stale(now, timeout);
            if stale {
                removed.push(*id);
            }
            !stale
        });
        removed.sort();

        if !removed.is_empty() {
            self.metrics.record_sessions_expired(removed.len() as u64);
            warn!(
                expired = removed.len(),
                remaining = self.sessions.len(),
                "Removed stale sessions"
            );
        }
        removed
    }

    /// Copy of every subscription, sorted by session id.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        subs.sort_by_key(|s| s.session_id);
        subs
    }

    pub fn get(&self, session_id: SessionId) -> Option<Subscription> {
        self.sessions.get(&session_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn check_filter(&self, filter: &SubscriptionFilter) -> Result<(), RegistryError> {
        let limit = self.config.max_symbols_per_session;
        if filter.symbols.len() > limit {
            return Err(RegistryError::FilterTooLarge {
                count: filter.symbols.len(),
                limit,
            });
        }
        Ok(())
    }
}
