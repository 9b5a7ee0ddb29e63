//! Event definitions for the market event stream
//!
//! Two layers live here:
//! - Inbound typed values (`Tick`, `MarketSignal`) as produced by the upstream
//!   detection subsystem.
//! - The transport-safe `Event` view that the buffer stores and the
//!   distributor emits. Its payload is a closed tagged union with one variant
//!   per `Category`, so downstream code never handles dynamically-shaped data.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::Symbol;
use crate::numeric::{Price, Volume};

/// Distribution category of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Tick,
    HighLow,
    Trend,
    Surge,
    Pattern,
}

impl Category {
    /// Every category, in buffer index order.
    pub const ALL: [Category; 5] = [
        Category::Tick,
        Category::HighLow,
        Category::Trend,
        Category::Surge,
        Category::Pattern,
    ];

    /// Dense index used for per-category storage.
    pub fn index(&self) -> usize {
        match self {
            Category::Tick => 0,
            Category::HighLow => 1,
            Category::Trend => 2,
            Category::Surge => 3,
            Category::Pattern => 4,
        }
    }

    /// Wire name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tick => "tick",
            Category::HighLow => "high_low",
            Category::Trend => "trend",
            Category::Surge => "surge",
            Category::Pattern => "pattern",
        }
    }

    /// Parse a wire name back into a category.
    pub fn parse(s: &str) -> Option<Self> {
        Category::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// A raw trade tick from the ingestion feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: Price,
    pub volume: Volume,
    /// Unix nanoseconds
    pub timestamp: i64,
}

/// Which extreme a high/low signal broke through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extreme {
    NewHigh,
    NewLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
}

/// An already-classified signal from the detection subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum MarketSignal {
    /// Price broke the session high or low
    HighLow {
        symbol: Symbol,
        extreme: Extreme,
        price: Price,
        /// Extreme that was broken, if one existed
        previous: Option<Price>,
        timestamp: i64,
    },

    /// Sustained directional move over a window
    Trend {
        symbol: Symbol,
        direction: TrendDirection,
        /// Normalised 0..1 strength score
        strength: Decimal,
        window_secs: u32,
        timestamp: i64,
    },

    /// Sudden price/volume burst
    Surge {
        symbol: Symbol,
        price: Price,
        change_pct: Decimal,
        /// Volume relative to the trailing average
        volume_ratio: Decimal,
        timestamp: i64,
    },

    /// Named chart pattern match
    Pattern {
        symbol: Symbol,
        name: String,
        confidence: Decimal,
        timeframe: String,
        timestamp: i64,
    },
}

impl MarketSignal {
    pub fn category(&self) -> Category {
        match self {
            MarketSignal::HighLow { .. } => Category::HighLow,
            MarketSignal::Trend { .. } => Category::Trend,
            MarketSignal::Surge { .. } => Category::Surge,
            MarketSignal::Pattern { .. } => Category::Pattern,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketSignal::HighLow { symbol, .. }
            | MarketSignal::Trend { symbol, .. }
            | MarketSignal::Surge { symbol, .. }
            | MarketSignal::Pattern { symbol, .. } => symbol,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            MarketSignal::HighLow { timestamp, .. }
            | MarketSignal::Trend { timestamp, .. }
            | MarketSignal::Surge { timestamp, .. }
            | MarketSignal::Pattern { timestamp, .. } => *timestamp,
        }
    }
}

/// Anything the ingest boundary accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Tick(Tick),
    Signal(MarketSignal),
}

impl From<Tick> for Inbound {
    fn from(tick: Tick) -> Self {
        Inbound::Tick(tick)
    }
}

impl From<MarketSignal> for Inbound {
    fn from(signal: MarketSignal) -> Self {
        Inbound::Signal(signal)
    }
}

// ── Distribution view ───────────────────────────────────────────────

/// Category-specific event data.
///
/// Serialises untagged: the enclosing message already names the category, so
/// the `data` object carries only the fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Tick {
        price: Price,
        volume: Volume,
    },
    HighLow {
        extreme: Extreme,
        price: Price,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<Price>,
    },
    Trend {
        direction: TrendDirection,
        strength: Decimal,
        window_secs: u32,
    },
    Surge {
        price: Price,
        change_pct: Decimal,
        volume_ratio: Decimal,
    },
    Pattern {
        name: String,
        confidence: Decimal,
        timeframe: String,
    },
}

impl EventPayload {
    pub fn category(&self) -> Category {
        match self {
            EventPayload::Tick { .. } => Category::Tick,
            EventPayload::HighLow { .. } => Category::HighLow,
            EventPayload::Trend { .. } => Category::Trend,
            EventPayload::Surge { .. } => Category::Surge,
            EventPayload::Pattern { .. } => Category::Pattern,
        }
    }
}

/// The distribution unit.
///
/// Immutable once enqueued; the distributor clones it into each matching
/// session's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Process-wide monotonic sequence assigned at ingest
    pub sequence: u64,
    pub symbol: Symbol,
    pub payload: EventPayload,
    /// Unix nanoseconds of detection
    pub produced_at: i64,
}

impl Event {
    pub fn category(&self) -> Category {
        self.payload.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_index_is_dense() {
        for (i, category) in Category::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn test_category_parse_roundtrip() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(category));
        }
        assert_eq!(Category::parse("volume"), None);
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&Category::HighLow).unwrap();
        assert_eq!(json, "\"high_low\"");
    }

    #[test]
    fn test_signal_category_and_symbol() {
        let signal = MarketSignal::Pattern {
            symbol: Symbol::new("NVDA"),
            name: "double_bottom".to_string(),
            confidence: Decimal::new(82, 2),
            timeframe: "5m".to_string(),
            timestamp: 1708123456789000000,
        };
        assert_eq!(signal.category(), Category::Pattern);
        assert_eq!(signal.symbol().as_str(), "NVDA");
        assert_eq!(signal.timestamp(), 1708123456789000000);
    }

    #[test]
    fn test_signal_deserializes_from_tagged_json() {
        let json = r#"{"category":"surge","symbol":"AMD","price":"150.5","change_pct":"3.2","volume_ratio":"4.0","timestamp":1}"#;
        let signal: MarketSignal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.category(), Category::Surge);
    }

    #[test]
    fn test_payload_serializes_untagged() {
        let payload = EventPayload::HighLow {
            extreme: Extreme::NewHigh,
            price: Price::from_u64(200),
            previous: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"extreme": "new_high", "price": "200"}));
    }
}
