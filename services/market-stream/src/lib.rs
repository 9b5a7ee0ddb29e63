//! Market Stream Service
//!
//! Takes already-classified market events (ticks, high/low breaks, trends,
//! surges, chart patterns) from the upstream detector and:
//! - Distributes them to many WebSocket subscribers, filtered per session
//! - Aggregates ticks into per-minute OHLCV bars persisted in batches
//!
//! Producers never block: both intake paths are bounded drop-oldest rings,
//! and every recoverable failure (overflow, dead session, store outage) is
//! contained and counted in [`metrics::ServiceMetrics`].
//!
//! # Architecture
//!
//! ```text
//!        Upstream detector
//!               │
//!        ┌──────▼──────┐
//!        │IngestAdapter│  ← Validates, assigns sequence
//!        └──┬───────┬──┘
//!    events │       │ bar deltas (ticks only)
//!   ┌───────▼──┐ ┌──▼─────────┐
//!   │EventBuffer│ │ DeltaQueue │
//!   └───────┬──┘ └──┬─────────┘
//!           │       │
//!  ┌────────▼─────┐ ┌▼──────────────┐
//!  │PullDistributor│ │PersistenceSink│  ← own thread, batch + retry
//!  └────────┬─────┘ └┬──────────────┘
//!           │        │
//!  ┌────────▼───────┐ ┌▼────────┐
//!  │ Subscriptions  │ │BarStore │
//!  │ → WebSocket    │ │(Postgres)│
//!  └────────────────┘ └─────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod distributor;
pub mod ingestion;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod service;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod websocket;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
