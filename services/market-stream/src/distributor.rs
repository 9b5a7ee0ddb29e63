//! Pull distributor
//!
//! The only consumer of the event buffer. Once per tick it:
//!
//! 1. expires sessions past the liveness timeout,
//! 2. drains every category,
//! 3. filters the drained events for each live session,
//! 4. sends each session with a non-empty subset one `event_batch`,
//!    concurrently and under a hard per-session deadline.
//!
//! A session whose send fails or times out is removed from the registry;
//! the cycle carries on with everyone else. Producers never wait on this
//! loop, so a slow session can only ever lose its own connection.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::errors::TransportError;
use types::event::Event;
use types::ids::SessionId;
use types::time::now_nanos;

use crate::buffer::EventDrain;
use crate::config::StreamConfig;
use crate::metrics::ServiceMetrics;
use crate::subscriptions::{Subscription, SubscriptionRegistry};
use crate::transport::encode_event_batch;

/// Where the distributor is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributorPhase {
    Idle,
    Draining,
    Filtering,
    Emitting,
}

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub tick_interval: Duration,
    pub emit_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for DistributorConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            emit_timeout: config.emit_timeout,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub events_drained: usize,
    /// Sessions sent a non-empty batch.
    pub sessions_emitted: usize,
    pub heartbeats: usize,
    /// Sessions removed after a failed or timed-out send.
    pub sessions_failed: Vec<SessionId>,
    /// Sessions removed by the liveness sweep.
    pub sessions_expired: Vec<SessionId>,
    pub duration: Duration,
}

struct Outgoing {
    subscription: Subscription,
    events: usize,
    payload: String,
}

pub struct PullDistributor {
    drain: EventDrain,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ServiceMetrics>,
    config: DistributorConfig,
    phase: DistributorPhase,
    cycles: u64,
}

impl PullDistributor {
    pub fn new(
        drain: EventDrain,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<ServiceMetrics>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            drain,
            registry,
            metrics,
            config,
            phase: DistributorPhase::Idle,
            cycles: 0,
        }
    }

    pub fn phase(&self) -> DistributorPhase {
        self.phase
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one cycle against the wall clock.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(now_nanos()).await
    }

    /// Run one cycle with `now` (Unix nanos) as the cycle time.
    pub async fn run_cycle_at(&mut self, now: i64) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        self.phase = DistributorPhase::Draining;
        report.sessions_expired = self.registry.remove_stale(now);
        let drained = self.drain.drain_all();
        let mut events: Vec<Event> = drained.into_values().flatten().collect();
        events.sort_by_key(|e| e.sequence);
        report.events_drained = events.len();

        self.phase = DistributorPhase::Filtering;
        let heartbeat_nanos = duration_nanos(self.config.heartbeat_interval);
        let mut outgoing = Vec::new();
        for subscription in self.registry.snapshot() {
            let matching: Vec<&Event> = events
                .iter()
                .filter(|e| subscription.filter.matches(e))
                .collect();
            if matching.is_empty() && !subscription.needs_heartbeat(now, heartbeat_nanos) {
                continue;
            }
            match encode_event_batch(now, &matching) {
                Ok(payload) => outgoing.push(Outgoing {
                    events: matching.len(),
                    subscription,
                    payload,
                }),
                Err(err) => {
                    warn!(session_id = %subscription.session_id, error = %err, "Failed to encode batch");
                }
            }
        }

        self.phase = DistributorPhase::Emitting;
        let deadline = self.config.emit_timeout;
        let timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        let results = join_all(outgoing.iter().map(|out| async move {
            match tokio::time::timeout(deadline, out.subscription.transport.send(&out.payload)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout { timeout_ms }),
            }
        }))
        .await;

        for (out, result) in outgoing.iter().zip(results) {
            let session_id = out.subscription.session_id;
            let heartbeat = out.events == 0;
            match result {
                Ok(()) => {
                    self.registry.record_emit(session_id, now, out.events);
                    self.metrics.record_emit(heartbeat);
                    if heartbeat {
                        report.heartbeats += 1;
                    } else {
                        report.sessions_emitted += 1;
                    }
                }
                Err(err) => {
                    let timed_out = matches!(err, TransportError::Timeout { .. });
                    self.metrics.record_emit_failure(timed_out);
                    self.registry.unregister(session_id);
                    warn!(
                        session_id = %session_id,
                        events = out.events,
                        error = %err,
                        "Session send failed, removing session"
                    );
                    report.sessions_failed.push(session_id);
                }
            }
        }

        report.duration = started.elapsed();
        let duration_ns = u64::try_from(report.duration.as_nanos()).unwrap_or(u64::MAX);
        self.metrics.record_cycle(report.events_drained as u64, duration_ns);
        self.phase = DistributorPhase::Idle;
        self.cycles += 1;

        if report.events_drained > 0 || !report.sessions_failed.is_empty() || !report.sessions_expired.is_empty() {
            debug!(
                cycle = self.cycles,
                drained = report.events_drained,
                emitted = report.sessions_emitted,
                heartbeats = report.heartbeats,
                failed = report.sessions_failed.len(),
                expired = report.sessions_expired.len(),
                duration_us = duration_ns / 1_000,
                "Distribution cycle"
            );
        }
        report
    }

    /// Run cycles on the timer until `shutdown` flips to true.
    ///
    /// A cycle that has started always completes before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            emit_timeout_ms = self.config.emit_timeout.as_millis() as u64,
            "Distributor started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.run_cycle().await;
                }
            }
        }

        info!(cycles = self.cycles, "Distributor stopped");
    }
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EventBuffer, EventPublisher};
    use crate::subscriptions::{RegistryConfig, SubscriptionFilter};
    use crate::transport::{ChannelTransport, SessionTransport};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;
    use types::event::{Category, EventPayload};
    use types::ids::Symbol;
    use types::numeric::{Price, Volume};

    const T0: i64 = 1708123456789000000;
    const SEC: i64 = 1_000_000_000;

    struct Harness {
        publisher: EventPublisher,
        distributor: PullDistributor,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<ServiceMetrics>,
    }

    fn harness(capacity: usize) -> Harness {
        let metrics = Arc::new(ServiceMetrics::new());
        let (publisher, drain) = EventBuffer::new(capacity, Arc::clone(&metrics));
        let registry = Arc::new(SubscriptionRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&metrics),
        ));
        let distributor = PullDistributor::new(
            drain,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            DistributorConfig::default(),
        );
        Harness {
            publisher,
            distributor,
            registry,
            metrics,
        }
    }

    fn connect(h: &Harness, filter: SubscriptionFilter) -> (SessionId, mpsc::Receiver<String>) {
        let (transport, rx) = ChannelTransport::new(16);
        let id = SessionId::new();
        h.registry.register(id, filter, Arc::new(transport), T0).unwrap();
        (id, rx)
    }

    fn tick(seq: u64, symbol: &str) -> Event {
        Event {
            sequence: seq,
            symbol: Symbol::new(symbol),
            payload: EventPayload::Tick {
                price: Price::from_u64(100),
                volume: Volume::from_u64(1),
            },
            produced_at: T0,
        }
    }

    fn surge(seq: u64, symbol: &str) -> Event {
        Event {
            sequence: seq,
            symbol: Symbol::new(symbol),
            payload: EventPayload::Surge {
                price: Price::from_u64(100),
                change_pct: Decimal::new(5, 0),
                volume_ratio: Decimal::new(3, 0),
            },
            produced_at: T0,
        }
    }

    fn batch(rx: &mut mpsc::Receiver<String>) -> Option<serde_json::Value> {
        rx.try_recv().ok().map(|s| serde_json::from_str(&s).unwrap())
    }

    #[tokio::test]
    async fn test_cycle_emits_filtered_batches() {
        let mut h = harness(100);
        let (_, mut aapl_rx) = connect(&h, SubscriptionFilter::for_symbols(["AAPL"]));
        let (_, mut all_rx) = connect(&h, SubscriptionFilter::all());

        h.publisher.enqueue(tick(1, "AAPL"));
        h.publisher.enqueue(tick(2, "MSFT"));

        let report = h.distributor.run_cycle_at(T0 + SEC).await;
        assert_eq!(report.events_drained, 2);
        assert_eq!(report.sessions_emitted, 2);

        let aapl = batch(&mut aapl_rx).unwrap();
        assert_eq!(aapl["events"].as_array().unwrap().len(), 1);
        assert_eq!(aapl["events"][0]["symbol"], "AAPL");
        assert_eq!(batch(&mut all_rx).unwrap()["events"].as_array().unwrap().len(), 2);
        assert_eq!(h.distributor.phase(), DistributorPhase::Idle);
    }

    #[tokio::test]
    async fn test_no_message_without_matching_events() {
        let mut h = harness(100);
        let (_, mut rx) = connect(&h, SubscriptionFilter::for_symbols(["NVDA"]));
        h.publisher.enqueue(tick(1, "AAPL"));

        let report = h.distributor.run_cycle_at(T0 + SEC).await;
        assert_eq!(report.sessions_emitted, 0);
        assert!(batch(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_batch_is_in_sequence_order_across_categories() {
        let mut h = harness(100);
        let (_, mut rx) = connect(&h, SubscriptionFilter::all());
        h.publisher.enqueue(surge(1, "AMD"));
        h.publisher.enqueue(tick(2, "AMD"));
        h.publisher.enqueue(surge(3, "AMD"));

        h.distributor.run_cycle_at(T0 + SEC).await;
        let value = batch(&mut rx).unwrap();
        let categories: Vec<&str> = value["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["category"].as_str().unwrap())
            .collect();
        assert_eq!(categories, vec!["surge", "tick", "surge"]);
    }

    #[tokio::test]
    async fn test_category_filter() {
        let mut h = harness(100);
        let (_, mut rx) = connect(&h, SubscriptionFilter::all().with_categories([Category::Surge]));
        h.publisher.enqueue(tick(1, "AMD"));
        h.publisher.enqueue(surge(2, "AMD"));

        h.distributor.run_cycle_at(T0 + SEC).await;
        let value = batch(&mut rx).unwrap();
        assert_eq!(value["events"].as_array().unwrap().len(), 1);
        assert_eq!(value["events"][0]["category"], "surge");
    }

    #[tokio::test]
    async fn test_closed_transport_removes_session_only() {
        let mut h = harness(100);
        let (dead, dead_rx) = connect(&h, SubscriptionFilter::all());
        let (alive, mut alive_rx) = connect(&h, SubscriptionFilter::all());
        drop(dead_rx);
        h.publisher.enqueue(tick(1, "AAPL"));

        let report = h.distributor.run_cycle_at(T0 + SEC).await;
        assert_eq!(report.sessions_failed, vec![dead]);
        assert_eq!(report.sessions_emitted, 1);
        assert!(h.registry.get(dead).is_none());
        assert!(h.registry.get(alive).is_some());
        assert!(batch(&mut alive_rx).is_some());
        assert_eq!(h.metrics.export()["emit_failures"], 1);
    }

    struct StalledTransport;

    #[async_trait]
    impl SessionTransport for StalledTransport {
        async fn send(&self, _payload: &str) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_session_bounded_by_emit_timeout() {
        let mut h = harness(100);
        let slow = SessionId::new();
        h.registry
            .register(slow, SubscriptionFilter::all(), Arc::new(StalledTransport), T0)
            .unwrap();
        let (_, mut fast_rx) = connect(&h, SubscriptionFilter::all());
        h.publisher.enqueue(tick(1, "AAPL"));

        let started = Instant::now();
        let report = h.distributor.run_cycle_at(T0 + SEC).await;

        assert!(started.elapsed() <= Duration::from_secs(1) + Duration::from_millis(10));
        assert_eq!(report.sessions_failed, vec![slow]);
        assert!(batch(&mut fast_rx).is_some());
        assert_eq!(h.metrics.export()["emit_timeouts"], 1);
    }

    #[tokio::test]
    async fn test_heartbeat_for_quiet_session() {
        let mut h = harness(100);
        let (id, mut rx) = connect(&h, SubscriptionFilter::for_symbols(["NVDA"]));

        h.distributor.run_cycle_at(T0 + 10 * SEC).await;
        assert!(batch(&mut rx).is_none());

        let report = h.distributor.run_cycle_at(T0 + 30 * SEC).await;
        assert_eq!(report.heartbeats, 1);
        let value = batch(&mut rx).unwrap();
        assert!(value["events"].as_array().unwrap().is_empty());
        assert_eq!(h.registry.get(id).unwrap().last_emit_at, Some(T0 + 30 * SEC));

        h.distributor.run_cycle_at(T0 + 31 * SEC).await;
        assert!(batch(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_stale_session_expired_before_drain() {
        let mut h = harness(100);
        let (id, mut rx) = connect(&h, SubscriptionFilter::all());
        h.publisher.enqueue(tick(1, "AAPL"));

        let report = h.distributor.run_cycle_at(T0 + 61 * SEC).await;
        assert_eq!(report.sessions_expired, vec![id]);
        assert_eq!(report.events_drained, 1);
        assert!(batch(&mut rx).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let h = harness(100);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.distributor.run(rx));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(h.metrics.cycle_latency_ns.lock().unwrap().count() >= 4);
    }
}
