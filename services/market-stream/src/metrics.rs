//! Observability counters for the stream node
//!
//! Every recoverable failure in the pipeline ends up here as a counter
//! increment: buffer overflow, session removal, store retries and drops.
//! Counters are relaxed atomics; the only lock guards the cycle latency
//! window. [`watch_thresholds`] turns threshold breaches into log lines.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Counters shared by every component of the node.
pub struct ServiceMetrics {
    // Ingest and buffer
    pub events_enqueued: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_drained: AtomicU64,

    // Distribution
    pub batches_emitted: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub emit_failures: AtomicU64,
    pub emit_timeouts: AtomicU64,
    pub sessions_registered: AtomicU64,
    pub sessions_expired: AtomicU64,
    pub cycle_latency_ns: Mutex<LatencyTracker>,

    // Persistence
    pub deltas_enqueued: AtomicU64,
    pub deltas_dropped: AtomicU64,
    pub deltas_deduplicated: AtomicU64,
    pub deltas_lost: AtomicU64,
    pub bars_upserted: AtomicU64,
    pub persistence_batches: AtomicU64,
    pub persistence_retries: AtomicU64,
    pub persistence_failures: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            events_enqueued: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_drained: AtomicU64::new(0),
            batches_emitted: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            emit_failures: AtomicU64::new(0),
            emit_timeouts: AtomicU64::new(0),
            sessions_registered: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            cycle_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            deltas_enqueued: AtomicU64::new(0),
            deltas_dropped: AtomicU64::new(0),
            deltas_deduplicated: AtomicU64::new(0),
            deltas_lost: AtomicU64::new(0),
            bars_upserted: AtomicU64::new(0),
            persistence_batches: AtomicU64::new(0),
            persistence_retries: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Record one event accepted into the buffer, and whether it evicted another.
    pub fn record_event_enqueued(&self, evicted: bool) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed distributor cycle.
    pub fn record_cycle(&self, drained: u64, duration_ns: u64) {
        self.events_drained.fetch_add(drained, Ordering::Relaxed);
        if let Ok(mut tracker) = self.cycle_latency_ns.lock() {
            tracker.record(duration_ns);
        }
    }

    pub fn record_emit(&self, heartbeat: bool) {
        if heartbeat {
            self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_emit_failure(&self, timed_out: bool) {
        self.emit_failures.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.emit_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_session_registered(&self) {
        self.sessions_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sessions_expired(&self, count: u64) {
        self.sessions_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_delta_enqueued(&self, evicted: bool) {
        self.deltas_enqueued.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.deltas_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deltas_deduplicated(&self, count: u64) {
        self.deltas_deduplicated.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a batch the store accepted.
    pub fn record_batch_persisted(&self, bars: u64) {
        self.persistence_batches.fetch_add(1, Ordering::Relaxed);
        self.bars_upserted.fetch_add(bars, Ordering::Relaxed);
    }

    pub fn record_persistence_retry(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch given up on after retries, with the deltas it carried.
    pub fn record_persistence_failure(&self, deltas: u64) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        self.deltas_lost.fetch_add(deltas, Ordering::Relaxed);
    }

    /// Record deltas abandoned without a store attempt (shutdown budget exhausted).
    pub fn record_deltas_lost(&self, deltas: u64) {
        self.deltas_lost.fetch_add(deltas, Ordering::Relaxed);
    }

    /// Check alert thresholds and generate alerts.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let dropped = self.events_dropped.load(Ordering::Relaxed);
        if dropped > thresholds.max_events_dropped {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "events_dropped".to_string(),
                message: format!("Events dropped: {} > threshold {}", dropped, thresholds.max_events_dropped),
            });
        }

        let emit_failures = self.emit_failures.load(Ordering::Relaxed);
        if emit_failures > thresholds.max_emit_failures {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "emit_failures".to_string(),
                message: format!("Emit failures: {} > threshold {}", emit_failures, thresholds.max_emit_failures),
            });
        }

        let lost = self.deltas_lost.load(Ordering::Relaxed);
        if lost > thresholds.max_deltas_lost {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "deltas_lost".to_string(),
                message: format!("Bar deltas lost: {} > threshold {}", lost, thresholds.max_deltas_lost),
            });
        }

        if let Ok(tracker) = self.cycle_latency_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_cycle_p99_ns {
                    alerts.push(Alert {
                        level: AlertLevel::Warning,
                        metric: "cycle_p99".to_string(),
                        message: format!("Distributor cycle p99: {}ns > threshold {}ns", p99, thresholds.max_cycle_p99_ns),
                    });
                }
            }
        }

        alerts
    }

    /// Export counters as a sorted map for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 18] = [
            ("events_enqueued", &self.events_enqueued),
            ("events_dropped", &self.events_dropped),
            ("events_rejected", &self.events_rejected),
            ("events_drained", &self.events_drained),
            ("batches_emitted", &self.batches_emitted),
            ("heartbeats_sent", &self.heartbeats_sent),
            ("emit_failures", &self.emit_failures),
            ("emit_timeouts", &self.emit_timeouts),
            ("sessions_registered", &self.sessions_registered),
            ("sessions_expired", &self.sessions_expired),
            ("deltas_enqueued", &self.deltas_enqueued),
            ("deltas_dropped", &self.deltas_dropped),
            ("deltas_deduplicated", &self.deltas_deduplicated),
            ("deltas_lost", &self.deltas_lost),
            ("bars_upserted", &self.bars_upserted),
            ("persistence_batches", &self.persistence_batches),
            ("persistence_retries", &self.persistence_retries),
            ("persistence_failures", &self.persistence_failures),
        ];

        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();

        if let Ok(tracker) = self.cycle_latency_ns.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("cycle_p50_ns".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("cycle_p99_ns".to_string(), p99);
            }
            if let Some(avg) = tracker.average() {
                m.insert("cycle_avg_ns".to_string(), avg);
            }
        }
        m
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p.min(100) * (sorted.len() - 1)) / 100;
        sorted.get(idx).copied()
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// An alert triggered by a threshold breach.
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Buffer overflow drops before a warning.
    pub max_events_dropped: u64,
    /// Session emit failures before a warning.
    pub max_emit_failures: u64,
    /// Bar deltas lost to store failure before a critical alert.
    pub max_deltas_lost: u64,
    /// Distributor cycle p99 in nanoseconds.
    pub max_cycle_p99_ns: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_events_dropped: 1000,
            max_emit_failures: 50,
            max_deltas_lost: 0,
            max_cycle_p99_ns: 50_000_000, // 50ms
        }
    }
}

/// Logs each metric once when it crosses its threshold.
///
/// Counters are cumulative, so a breached metric stays breached; only newly
/// raised alerts are logged.
pub struct AlertReporter {
    thresholds: AlertThresholds,
    active: BTreeSet<String>,
}

impl AlertReporter {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            active: BTreeSet::new(),
        }
    }

    /// Check `metrics` and log alerts not raised by an earlier poll.
    pub fn poll(&mut self, metrics: &ServiceMetrics) -> Vec<Alert> {
        let alerts = metrics.check_thresholds(&self.thresholds);
        let current: BTreeSet<String> = alerts.iter().map(|a| a.metric.clone()).collect();
        let raised: Vec<Alert> = alerts
            .into_iter()
            .filter(|a| !self.active.contains(&a.metric))
            .collect();

        for alert in &raised {
            match alert.level {
                AlertLevel::Critical => error!(metric = %alert.metric, "{}", alert.message),
                AlertLevel::Warning => warn!(metric = %alert.metric, "{}", alert.message),
            }
        }
        for cleared in self.active.difference(&current) {
            info!(metric = %cleared, "Alert cleared");
        }

        self.active = current;
        raised
    }
}

/// Run an [`AlertReporter`] every `period` until `shutdown` flips.
pub async fn watch_thresholds(
    metrics: Arc<ServiceMetrics>,
    thresholds: AlertThresholds,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reporter = AlertReporter::new(thresholds);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                reporter.poll(&metrics);
            }
        }
    }
    debug!("Threshold watch stopped");
}
