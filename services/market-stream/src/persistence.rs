//! Minute-bar persistence sink
//!
//! Ticks become `BarDelta`s at ingest and land in a bounded drop-oldest
//! [`DeltaQueue`]. A dedicated thread with its own single-threaded runtime
//! drains the queue whenever a full batch is waiting or the flush interval
//! fires, merges deltas per `(symbol, minute)` and hands the result to the
//! [`BarStore`] with bounded exponential-backoff retries.
//!
//! Nothing here can slow ingest down or surface an error to it: overflow
//! evicts the oldest delta, and a batch that still fails after its retries
//! is dropped and counted.
//!
//! ```text
//!   IngestAdapter ──enqueue──▶ DeltaQueue ──take──▶ BatchWriter ──▶ BarStore
//!                               (ring)     notify/    dedup, merge,
//!                                          interval   retry
//! ```

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use types::bar::{BarDelta, BarKey, MinuteBar};
use types::errors::StoreError;
use types::ids::{BatchId, DeltaId};
use types::time::{nanos_to_millis, now_nanos};

use crate::config::PersistenceConfig;
use crate::metrics::ServiceMetrics;
use crate::queue::BoundedQueue;
use crate::store::{BarStore, UpsertOutcome};

/// Intake entry: a delta plus when it was queued.
#[derive(Debug, Clone)]
pub struct QueuedDelta {
    pub delta: BarDelta,
    /// Unix nanos
    pub enqueued_at: i64,
}

struct DeltaShared {
    ring: BoundedQueue<QueuedDelta>,
    batch_size: usize,
    wake: Notify,
    overflow_logged: AtomicBool,
    /// Deltas taken by the sink and not yet written or dropped
    in_flight: AtomicUsize,
    metrics: Arc<ServiceMetrics>,
}

/// Producer handle for the persistence intake. Cheap to clone.
#[derive(Clone)]
pub struct DeltaQueue {
    shared: Arc<DeltaShared>,
}

impl DeltaQueue {
    pub fn new(capacity: usize, batch_size: usize, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            shared: Arc::new(DeltaShared {
                ring: BoundedQueue::new(capacity),
                batch_size,
                wake: Notify::new(),
                overflow_logged: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    /// Queue a delta without blocking; evicts the oldest one on overflow.
    pub fn enqueue(&self, delta: BarDelta) {
        let shared = &self.shared;
        let evicted = shared.ring.push(QueuedDelta {
            delta,
            enqueued_at: now_nanos(),
        });
        shared.metrics.record_delta_enqueued(evicted.is_some());

        if let Some(old) = evicted {
            if !shared.overflow_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    capacity = shared.ring.capacity(),
                    evicted_symbol = %old.delta.symbol,
                    "Persistence queue overflow, dropping oldest delta"
                );
            }
        }

        if shared.ring.len() >= shared.batch_size {
            shared.wake.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Deltas evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.shared.ring.dropped()
    }

    fn take(&self, max: usize) -> Vec<QueuedDelta> {
        self.shared.overflow_logged.store(false, Ordering::Relaxed);
        let taken = self.shared.ring.drain(max);
        self.shared.in_flight.store(taken.len(), Ordering::Relaxed);
        taken
    }

    /// Mark the last taken batch as written or accounted for.
    fn settle(&self) {
        self.shared.in_flight.store(0, Ordering::Relaxed);
    }

    /// Queued plus taken-but-unsettled deltas.
    fn outstanding(&self) -> usize {
        self.len() + self.shared.in_flight.load(Ordering::Relaxed)
    }

    async fn notified(&self) {
        self.shared.wake.notified().await
    }
}

/// Bars merged from one batch of deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedDeltas {
    /// One bar per `(symbol, minute)`, in key order
    pub bars: Vec<MinuteBar>,
    /// Deltas whose volume would overflow their bar
    pub rejected: Vec<DeltaId>,
}

/// Merge deltas into one bar per `(symbol, minute)`.
pub fn merge_deltas(deltas: &[BarDelta]) -> MergedDeltas {
    let mut bars: BTreeMap<BarKey, MinuteBar> = BTreeMap::new();
    let mut rejected = Vec::new();
    for delta in deltas {
        match bars.entry(delta.key()) {
            Entry::Occupied(mut slot) => {
                if let Err(err) = slot.get_mut().apply(delta) {
                    warn!(delta_id = %delta.delta_id, symbol = %delta.symbol, error = %err, "Rejected bar delta");
                    rejected.push(delta.delta_id);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(MinuteBar::from_delta(delta));
            }
        }
    }
    MergedDeltas {
        bars: bars.into_values().collect(),
        rejected,
    }
}

/// Bounded memory of delta ids the store has accepted.
struct DedupWindow {
    order: VecDeque<DeltaId>,
    ids: HashSet<DeltaId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &DeltaId) -> bool {
        self.ids.contains(id)
    }

    fn record(&mut self, id: DeltaId) {
        if !self.ids.insert(id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id);
    }
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing left to write after deduplication.
    Empty,
    Applied,
    /// The store had already applied this batch id.
    AlreadyApplied,
    /// Retries exhausted; the batch was dropped.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub batch_id: Option<BatchId>,
    pub deltas: usize,
    pub duplicates: usize,
    /// Deltas dropped at merge time
    pub rejected: usize,
    pub bars: usize,
    pub attempts: u32,
    pub outcome: FlushOutcome,
}

/// Dedup, merge and write one batch with retries.
pub struct BatchWriter<S> {
    store: S,
    config: PersistenceConfig,
    committed: DedupWindow,
    metrics: Arc<ServiceMetrics>,
}

impl<S: BarStore> BatchWriter<S> {
    pub fn new(store: S, config: &PersistenceConfig, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            store,
            committed: DedupWindow::new(config.dedup_window),
            config: config.clone(),
            metrics,
        }
    }

    pub async fn write(&mut self, deltas: Vec<BarDelta>) -> FlushReport {
        let received = deltas.len();
        let mut seen = HashSet::with_capacity(received);
        let fresh: Vec<BarDelta> = deltas
            .into_iter()
            .filter(|d| !self.committed.contains(&d.delta_id) && seen.insert(d.delta_id))
            .collect();
        let duplicates = received - fresh.len();
        if duplicates > 0 {
            self.metrics.record_deltas_deduplicated(duplicates as u64);
            debug!(duplicates, "Skipped re-delivered deltas");
        }

        let mut report = FlushReport {
            batch_id: None,
            deltas: fresh.len(),
            duplicates,
            rejected: 0,
            bars: 0,
            attempts: 0,
            outcome: FlushOutcome::Empty,
        };
        if fresh.is_empty() {
            return report;
        }

        let MergedDeltas { bars, rejected } = merge_deltas(&fresh);
        if !rejected.is_empty() {
            self.metrics.record_deltas_lost(rejected.len() as u64);
            report.rejected = rejected.len();
            report.deltas -= rejected.len();
        }
        if bars.is_empty() {
            return report;
        }

        let batch_id = BatchId::new();
        report.batch_id = Some(batch_id);
        report.bars = bars.len();

        loop {
            report.attempts += 1;
            match self.store.upsert_bars(batch_id, &bars).await {
                Ok(outcome) => {
                    for delta in &fresh {
                        self.committed.record(delta.delta_id);
                    }
                    report.outcome = match outcome {
                        UpsertOutcome::Applied { rows } => {
                            self.metrics.record_batch_persisted(rows as u64);
                            FlushOutcome::Applied
                        }
                        UpsertOutcome::AlreadyApplied => FlushOutcome::AlreadyApplied,
                    };
                    debug!(
                        batch_id = %batch_id,
                        deltas = report.deltas,
                        bars = report.bars,
                        attempts = report.attempts,
                        outcome = ?report.outcome,
                        "Batch persisted"
                    );
                    return report;
                }
                Err(err) => {
                    let retries_used = report.attempts - 1;
                    if retries_used >= self.config.max_retries {
                        self.fail(&mut report, batch_id, &err);
                        return report;
                    }
                    let delay = self.config.backoff(retries_used);
                    self.metrics.record_persistence_retry();
                    warn!(
                        batch_id = %batch_id,
                        attempt = report.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Bar upsert failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn fail(&self, report: &mut FlushReport, batch_id: BatchId, err: &StoreError) {
        report.outcome = FlushOutcome::Failed;
        self.metrics.record_persistence_failure(report.deltas as u64);
        error!(
            batch_id = %batch_id,
            attempts = report.attempts,
            deltas = report.deltas,
            bars = report.bars,
            error = %err,
            "Dropping bar batch after retries"
        );
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Handle to the persistence thread.
pub struct PersistenceSink {
    queue: DeltaQueue,
    metrics: Arc<ServiceMetrics>,
    shutdown_tx: watch::Sender<bool>,
    done_rx: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PersistenceSink {
    /// Start the sink thread.
    ///
    /// `make_store` runs on the sink's own runtime, so stores holding
    /// runtime-bound resources (connection pools) are created there.
    pub fn spawn<F, Fut, S>(
        config: PersistenceConfig,
        metrics: Arc<ServiceMetrics>,
        make_store: F,
    ) -> std::io::Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, StoreError>>,
        S: BarStore + 'static,
    {
        let queue = DeltaQueue::new(config.queue_capacity, config.batch_size, Arc::clone(&metrics));
        let sink_metrics = Arc::clone(&metrics);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let worker_queue = queue.clone();
        let thread = std::thread::Builder::new()
            .name("persistence-sink".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match make_store().await {
                        Ok(store) => {
                            let writer = BatchWriter::new(store, &config, Arc::clone(&metrics));
                            run_sink(worker_queue, writer, &config, metrics, shutdown_rx).await;
                        }
                        Err(err) => {
                            error!(error = %err, "Bar store unavailable, persistence disabled");
                            wait_for_shutdown(shutdown_rx).await;
                            metrics.record_deltas_lost(worker_queue.len() as u64);
                        }
                    }
                });
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            queue,
            metrics: sink_metrics,
            shutdown_tx,
            done_rx: Some(done_rx),
            thread: Some(thread),
        })
    }

    /// Producer handle for the ingest side.
    pub fn queue(&self) -> DeltaQueue {
        self.queue.clone()
    }

    /// Stop accepting timer work, drain the queue once and join the thread.
    ///
    /// If the thread died early, whatever it left behind is counted as lost.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        let mut finished = true;
        if let Some(done) = self.done_rx.take() {
            finished = done.await.is_ok();
        }
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            finished &= matches!(joined, Ok(Ok(())));
        }

        if !finished {
            let lost = self.queue.outstanding();
            self.metrics.record_deltas_lost(lost as u64);
            error!(lost, "Persistence thread terminated abnormally");
        }
    }
}

impl Drop for PersistenceSink {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_sink<S: BarStore>(
    queue: DeltaQueue,
    mut writer: BatchWriter<S>,
    config: &PersistenceConfig,
    metrics: Arc<ServiceMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    info!(
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        queue_capacity = queue.capacity(),
        "Persistence sink started"
    );

    loop {
        let on_interval = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = queue.notified() => false,
            _ = ticker.tick() => true,
        };
        flush_ready(&queue, &mut writer, config.batch_size, on_interval).await;
    }

    // Final drain under a single deadline.
    let deadline = Instant::now() + config.shutdown_flush_timeout;
    let pending = queue.len();
    let mut flushed = 0usize;
    while !queue.is_empty() {
        let batch: Vec<BarDelta> = queue.take(config.batch_size).into_iter().map(|q| q.delta).collect();
        let in_flight = batch.len();
        let written = tokio::time::timeout_at(deadline, writer.write(batch)).await;
        queue.settle();
        match written {
            Ok(_) => flushed += in_flight,
            Err(_) => {
                let lost = in_flight + queue.len();
                metrics.record_deltas_lost(lost as u64);
                error!(
                    lost,
                    timeout_ms = config.shutdown_flush_timeout.as_millis() as u64,
                    "Shutdown flush timed out"
                );
                break;
            }
        }
    }

    info!(pending, flushed, "Persistence sink stopped");
}

/// Write full batches; on the interval also write the partial remainder.
async fn flush_ready<S: BarStore>(
    queue: &DeltaQueue,
    writer: &mut BatchWriter<S>,
    batch_size: usize,
    on_interval: bool,
) {
    // On the interval, flush what is present now, not what keeps arriving.
    let mut budget = if on_interval { queue.len() } else { usize::MAX };
    while budget > 0 {
        let len = queue.len();
        if len == 0 || (!on_interval && len < batch_size) {
            break;
        }
        let taken = queue.take(batch_size.min(budget));
        if taken.is_empty() {
            break;
        }
        budget = budget.saturating_sub(taken.len());

        let oldest_ms = taken
            .iter()
            .map(|q| q.enqueued_at)
            .min()
            .map(|ts| nanos_to_millis(now_nanos() - ts))
            .unwrap_or(0);
        let deltas: Vec<BarDelta> = taken.into_iter().map(|q| q.delta).collect();
        let report = writer.write(deltas).await;
        queue.settle();
        debug!(
            deltas = report.deltas,
            bars = report.bars,
            oldest_ms,
            on_interval,
            "Flush complete"
        );
    }
}
