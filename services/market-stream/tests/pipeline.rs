//! End-to-end scenarios for the stream node
//!
//! Drives the public pipeline (ingest → buffer → distributor → sessions,
//! ingest → delta queue → sink → store) with in-memory transports and an
//! in-memory bar store.
//!
//! Tests include:
//! - Surge overflow: only the most recent `capacity` events survive
//! - Minute-bar aggregation through the persistence sink
//! - Disjoint session filters
//! - Slow consumer isolation
//! - Re-delivered deltas and retried batches applied once

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use market_stream::buffer::{EventBuffer, EventPublisher};
use market_stream::config::PersistenceConfig;
use market_stream::distributor::{DistributorConfig, PullDistributor};
use market_stream::ingestion::IngestAdapter;
use market_stream::metrics::ServiceMetrics;
use market_stream::persistence::{BatchWriter, DeltaQueue, FlushOutcome, PersistenceSink};
use market_stream::store::MemoryBarStore;
use market_stream::subscriptions::{RegistryConfig, SubscriptionFilter, SubscriptionRegistry};
use market_stream::transport::{ChannelTransport, SessionTransport};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use types::bar::{truncate_to_minute, BarDelta};
use types::errors::{StoreError, TransportError};
use types::event::{MarketSignal, Tick};
use types::ids::{SessionId, Symbol};
use types::numeric::{Price, Volume};

const T0: i64 = 1708123456789000000;

struct Node {
    ingest: IngestAdapter,
    distributor: PullDistributor,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ServiceMetrics>,
    publisher: EventPublisher,
}

fn node(capacity: usize) -> Node {
    let metrics = Arc::new(ServiceMetrics::new());
    let (publisher, drain) = EventBuffer::new(capacity, Arc::clone(&metrics));
    let registry = Arc::new(SubscriptionRegistry::new(
        RegistryConfig::default(),
        Arc::clone(&metrics),
    ));
    let deltas = DeltaQueue::new(1000, 100, Arc::clone(&metrics));
    let ingest = IngestAdapter::new(publisher.clone(), deltas, Arc::clone(&metrics));
    let distributor = PullDistributor::new(
        drain,
        Arc::clone(&registry),
        Arc::clone(&metrics),
        DistributorConfig::default(),
    );
    Node {
        ingest,
        distributor,
        registry,
        metrics,
        publisher,
    }
}

fn connect(node: &Node, filter: SubscriptionFilter, capacity: usize) -> (SessionId, mpsc::Receiver<String>) {
    let (transport, rx) = ChannelTransport::new(capacity);
    let id = SessionId::new();
    node.registry.register(id, filter, Arc::new(transport), T0).unwrap();
    (id, rx)
}

fn surge(symbol: &str, price: u64, ts: i64) -> MarketSignal {
    MarketSignal::Surge {
        symbol: Symbol::new(symbol),
        price: Price::from_u64(price),
        change_pct: Decimal::new(42, 1),
        volume_ratio: Decimal::new(3, 0),
        timestamp: ts,
    }
}

fn tick(symbol: &str, price: u64, volume: u64, ts: i64) -> Tick {
    Tick {
        symbol: Symbol::new(symbol),
        price: Price::from_u64(price),
        volume: Volume::from_u64(volume),
        timestamp: ts,
    }
}

fn events(rx: &mut mpsc::Receiver<String>) -> Option<Vec<serde_json::Value>> {
    let raw = rx.try_recv().ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["type"], "event_batch");
    Some(value["events"].as_array().unwrap().clone())
}

#[tokio::test]
async fn test_surge_overflow_keeps_latest_capacity() {
    let mut node = node(1000);
    let (_, mut rx) = connect(&node, SubscriptionFilter::all(), 4);

    for i in 1..=1500u64 {
        node.ingest.on_incoming(surge("AMD", i, T0 + i as i64)).unwrap();
    }
    assert_eq!(node.publisher.dropped(types::event::Category::Surge), 500);

    let report = node.distributor.run_cycle_at(T0 + 1_000_000_000).await;
    assert_eq!(report.events_drained, 1000);

    let batch = events(&mut rx).unwrap();
    assert_eq!(batch.len(), 1000);
    assert_eq!(batch[0]["data"]["price"], "501");
    assert_eq!(batch[999]["data"]["price"], "1500");

    let exported = node.metrics.export();
    assert_eq!(exported["events_enqueued"], 1500);
    assert_eq!(exported["events_dropped"], 500);
    assert_eq!(exported["events_drained"], 1000);
}

#[tokio::test]
async fn test_disjoint_filters_receive_only_their_symbols() {
    let mut node = node(100);
    let (_, mut aapl) = connect(&node, SubscriptionFilter::for_symbols(["AAPL"]), 4);
    let (_, mut msft) = connect(&node, SubscriptionFilter::for_symbols(["MSFT"]), 4);
    let (_, mut nvda) = connect(&node, SubscriptionFilter::for_symbols(["NVDA"]), 4);

    node.ingest.on_incoming(tick("AAPL", 190, 10, T0)).unwrap();
    node.ingest.on_incoming(surge("MSFT", 410, T0 + 1)).unwrap();
    node.ingest.on_incoming(tick("AAPL", 191, 5, T0 + 2)).unwrap();

    let report = node.distributor.run_cycle_at(T0 + 1_000_000_000).await;
    assert_eq!(report.sessions_emitted, 2);

    let aapl_events = events(&mut aapl).unwrap();
    assert_eq!(aapl_events.len(), 2);
    assert!(aapl_events.iter().all(|e| e["symbol"] == "AAPL"));

    let msft_events = events(&mut msft).unwrap();
    assert_eq!(msft_events.len(), 1);
    assert_eq!(msft_events[0]["category"], "surge");

    assert!(events(&mut nvda).is_none());
}

struct StalledTransport;

#[async_trait]
impl SessionTransport for StalledTransport {
    async fn send(&self, _payload: &str) -> Result<(), TransportError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_is_isolated() {
    let mut node = node(100);
    let slow = SessionId::new();
    node.registry
        .register(slow, SubscriptionFilter::all(), Arc::new(StalledTransport), T0)
        .unwrap();
    let (fast, mut fast_rx) = connect(&node, SubscriptionFilter::all(), 4);

    node.ingest.on_incoming(tick("AAPL", 190, 10, T0)).unwrap();
    let report = node.distributor.run_cycle_at(T0 + 1_000_000_000).await;

    assert_eq!(report.sessions_failed, vec![slow]);
    assert_eq!(events(&mut fast_rx).unwrap().len(), 1);
    assert!(node.registry.get(slow).is_none());

    // The next cycle proceeds without the removed session.
    node.ingest.on_incoming(tick("AAPL", 191, 10, T0 + 1)).unwrap();
    let report = node.distributor.run_cycle_at(T0 + 2_000_000_000).await;
    assert!(report.sessions_failed.is_empty());
    assert_eq!(events(&mut fast_rx).unwrap().len(), 1);
    assert!(node.registry.get(fast).is_some());
}

#[tokio::test]
async fn test_full_outbound_channel_removes_session() {
    let mut node = node(100);
    let (id, mut rx) = connect(&node, SubscriptionFilter::all(), 1);

    node.ingest.on_incoming(tick("AAPL", 190, 10, T0)).unwrap();
    node.distributor.run_cycle_at(T0 + 1_000_000_000).await;

    // Writer never drained the first batch.
    node.ingest.on_incoming(tick("AAPL", 191, 10, T0 + 1)).unwrap();
    let report = node.distributor.run_cycle_at(T0 + 2_000_000_000).await;
    assert_eq!(report.sessions_failed, vec![id]);
    assert_eq!(events(&mut rx).unwrap().len(), 1);
}

#[tokio::test]
async fn test_minute_bar_aggregated_through_sink() {
    let metrics = Arc::new(ServiceMetrics::new());
    let store = Arc::new(MemoryBarStore::new());
    let handle = Arc::clone(&store);
    let sink = PersistenceSink::spawn(PersistenceConfig::default(), Arc::clone(&metrics), move || async move {
        Ok::<_, StoreError>(handle)
    })
    .unwrap();

    let (publisher, _drain) = EventBuffer::new(100, Arc::clone(&metrics));
    let ingest = IngestAdapter::new(publisher, sink.queue(), Arc::clone(&metrics));
    ingest.on_incoming(tick("AAPL", 190, 100, T0)).unwrap();
    ingest.on_incoming(tick("AAPL", 185, 150, T0 + 1_000_000)).unwrap();
    ingest.on_incoming(surge("AAPL", 999, T0 + 2_000_000)).unwrap();

    sink.shutdown().await;

    let minute = truncate_to_minute(T0);
    let bar = store.bar(&Symbol::new("AAPL"), minute).unwrap();
    assert_eq!(bar.volume, Volume::from_u64(250));
    assert_eq!(bar.high, Price::from_u64(190));
    assert_eq!(bar.low, Price::from_u64(185));
    assert_eq!(bar.open, Price::from_u64(190));
    assert_eq!(bar.close, Price::from_u64(185));
    assert_eq!(bar.tick_count, 2);
    assert_eq!(store.bars().len(), 1);
    assert_eq!(metrics.export()["deltas_enqueued"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_and_retry_apply_once() {
    let metrics = Arc::new(ServiceMetrics::new());
    let store = Arc::new(MemoryBarStore::new());
    let mut writer = BatchWriter::new(Arc::clone(&store), &PersistenceConfig::default(), Arc::clone(&metrics));

    let deltas = vec![
        BarDelta::from_tick(Symbol::new("TSLA"), Price::from_u64(200), Volume::from_u64(7), T0),
        BarDelta::from_tick(Symbol::new("TSLA"), Price::from_u64(205), Volume::from_u64(3), T0 + 1),
    ];

    store.fail_next(2);
    let first = writer.write(deltas.clone()).await;
    assert_eq!(first.outcome, FlushOutcome::Applied);
    assert_eq!(first.attempts, 3);

    let again = writer.write(deltas).await;
    assert_eq!(again.outcome, FlushOutcome::Empty);
    assert_eq!(again.duplicates, 2);

    let bar = store.bar(&Symbol::new("TSLA"), truncate_to_minute(T0)).unwrap();
    assert_eq!(bar.volume, Volume::from_u64(10));
    assert_eq!(store.applied_batches(), 1);
    assert_eq!(metrics.export()["persistence_retries"], 2);
}

#[tokio::test]
async fn test_store_outage_does_not_block_ingest() {
    let metrics = Arc::new(ServiceMetrics::new());
    let config = PersistenceConfig {
        queue_capacity: 10,
        batch_size: 5,
        shutdown_flush_timeout: Duration::from_millis(50),
        ..PersistenceConfig::default()
    };
    let sink = PersistenceSink::spawn(config, Arc::clone(&metrics), || async {
        Err::<Arc<MemoryBarStore>, _>(StoreError::Unavailable("connection refused".to_string()))
    })
    .unwrap();

    let (publisher, _drain) = EventBuffer::new(100, Arc::clone(&metrics));
    let ingest = IngestAdapter::new(publisher, sink.queue(), Arc::clone(&metrics));
    for i in 0..25 {
        ingest.on_incoming(tick("AAPL", 100 + i, 1, T0 + i as i64)).unwrap();
    }
    assert_eq!(ingest.last_sequence(), 25);

    sink.shutdown().await;
    let exported = metrics.export();
    assert_eq!(exported["deltas_dropped"], 15);
    assert_eq!(exported["deltas_lost"], 10);
}
