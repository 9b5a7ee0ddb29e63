//! Minute bars and tick-derived bar deltas
//!
//! The ingest path emits one `BarDelta` per tick; the persistence sink merges
//! deltas sharing a `(symbol, minute)` key into a `MinuteBar` and the store
//! merges that bar into whatever row already exists.
//!
//! `MinuteBar::merge` is commutative and associative: open and close are
//! chosen by tick timestamp (ties broken by price), extrema by max/min, and
//! volume and tick count are summed. Arrival order of deltas, inside a batch
//! or across batches, therefore never changes the stored aggregate.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::errors::ValueError;
use crate::ids::{DeltaId, Symbol};
use crate::numeric::{Price, Volume};
use crate::time::NANOS_PER_SEC;

/// Length of a bar in nanoseconds.
pub const MINUTE_NANOS: i64 = 60 * NANOS_PER_SEC;

/// Align a timestamp to its minute boundary (floor, also for pre-epoch values).
pub fn truncate_to_minute(timestamp_nanos: i64) -> i64 {
    timestamp_nanos.div_euclid(MINUTE_NANOS) * MINUTE_NANOS
}

/// Identity of a bar row.
pub type BarKey = (Symbol, i64);

/// Per-tick contribution to a minute bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarDelta {
    pub delta_id: DeltaId,
    pub symbol: Symbol,
    /// Minute boundary, Unix nanoseconds
    pub minute: i64,
    pub price: Price,
    pub volume: Volume,
    /// Tick time, Unix nanoseconds
    pub tick_ts: i64,
}

impl BarDelta {
    /// Build a delta for a tick, truncating its timestamp to the minute.
    pub fn from_tick(symbol: Symbol, price: Price, volume: Volume, tick_ts: i64) -> Self {
        Self {
            delta_id: DeltaId::new(),
            symbol,
            minute: truncate_to_minute(tick_ts),
            price,
            volume,
            tick_ts,
        }
    }

    pub fn key(&self) -> BarKey {
        (self.symbol.clone(), self.minute)
    }
}

/// One aggregated OHLCV row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub symbol: Symbol,
    /// Minute boundary, Unix nanoseconds
    pub minute: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Volume,
    /// Tick time of the open price
    pub open_ts: i64,
    /// Tick time of the close price
    pub close_ts: i64,
    pub tick_count: u64,
}

impl MinuteBar {
    /// Create a bar holding a single delta.
    pub fn from_delta(delta: &BarDelta) -> Self {
        Self {
            symbol: delta.symbol.clone(),
            minute: delta.minute,
            open: delta.price,
            high: delta.price,
            low: delta.price,
            close: delta.price,
            volume: delta.volume,
            open_ts: delta.tick_ts,
            close_ts: delta.tick_ts,
            tick_count: 1,
        }
    }

    pub fn key(&self) -> BarKey {
        (self.symbol.clone(), self.minute)
    }

    /// Fold a delta into this bar.
    pub fn apply(&mut self, delta: &BarDelta) -> Result<(), ValueError> {
        self.merge(&MinuteBar::from_delta(delta))
    }

    /// Merge another bar with the same key into this one.
    ///
    /// Bars with different keys are left untouched; callers group by key
    /// before merging. If the summed volume overflows, the bar is left
    /// unchanged and the error returned.
    pub fn merge(&mut self, other: &MinuteBar) -> Result<(), ValueError> {
        if self.key() != other.key() {
            return Ok(());
        }
        let volume = self.volume.checked_add(other.volume).ok_or_else(|| {
            ValueError::VolumeOverflow(self.volume.to_string(), other.volume.to_string())
        })?;

        let take_open = match other.open_ts.cmp(&self.open_ts) {
            Ordering::Less => true,
            Ordering::Equal => other.open < self.open,
            Ordering::Greater => false,
        };
        if take_open {
            self.open = other.open;
            self.open_ts = other.open_ts;
        }

        let take_close = match other.close_ts.cmp(&self.close_ts) {
            Ordering::Greater => true,
            Ordering::Equal => other.close > self.close,
            Ordering::Less => false,
        };
        if take_close {
            self.close = other.close;
            self.close_ts = other.close_ts;
        }

        if other.high > self.high {
            self.high = other.high;
        }
        if other.low < self.low {
            self.low = other.low;
        }
        self.volume = volume;
        self.tick_count += other.tick_count;
        Ok(())
    }

    /// Validate bar integrity (OHLC invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.open_ts <= self.close_ts
            && truncate_to_minute(self.open_ts) == self.minute
            && truncate_to_minute(self.close_ts) == self.minute
    }
}
