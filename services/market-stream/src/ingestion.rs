//! Ingest boundary
//!
//! Converts inbound typed ticks and signals into the transport-safe `Event`
//! view, assigns a process-wide sequence number, and fans out to the event
//! buffer and (for ticks) the persistence intake. Both hand-offs are
//! fire-and-forget; the only way `on_incoming` fails is validation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};
use types::bar::BarDelta;
use types::errors::{IngestError, ValueError};
use types::event::{Event, EventPayload, Inbound, MarketSignal, Tick};
use types::ids::Symbol;
use types::numeric::{Price, Volume};

use crate::buffer::EventPublisher;
use crate::metrics::ServiceMetrics;
use crate::persistence::DeltaQueue;

/// Largest volume a single tick may carry. Keeps per-minute sums far from
/// the `Decimal` range.
pub const MAX_TICK_VOLUME: u64 = 1_000_000_000_000_000_000;

/// Result of classifying one inbound value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub event: Event,
    /// Present for inputs that feed minute bars (ticks only).
    pub delta: Option<BarDelta>,
}

/// Map an inbound value to its event view and optional bar delta.
///
/// Every `Inbound` variant has exactly one mapping; the only failures are
/// values that break the numeric or symbol invariants.
pub fn classify(inbound: Inbound, sequence: u64) -> Result<Classified, IngestError> {
    match inbound {
        Inbound::Tick(Tick {
            symbol,
            price,
            volume,
            timestamp,
        }) => {
            check_symbol(&symbol)?;
            check_price(price)?;
            check_volume(volume)?;
            check_timestamp(timestamp)?;

            let delta = BarDelta::from_tick(symbol.clone(), price, volume, timestamp);
            Ok(Classified {
                event: Event {
                    sequence,
                    symbol,
                    payload: EventPayload::Tick { price, volume },
                    produced_at: timestamp,
                },
                delta: Some(delta),
            })
        }
        Inbound::Signal(signal) => {
            check_symbol(signal.symbol())?;
            check_timestamp(signal.timestamp())?;

            let (symbol, payload, produced_at) = match signal {
                MarketSignal::HighLow {
                    symbol,
                    extreme,
                    price,
                    previous,
                    timestamp,
                } => {
                    check_price(price)?;
                    if let Some(prev) = previous {
                        check_price(prev)?;
                    }
                    (symbol, EventPayload::HighLow { extreme, price, previous }, timestamp)
                }
                MarketSignal::Trend {
                    symbol,
                    direction,
                    strength,
                    window_secs,
                    timestamp,
                } => (
                    symbol,
                    EventPayload::Trend {
                        direction,
                        strength,
                        window_secs,
                    },
                    timestamp,
                ),
                MarketSignal::Surge {
                    symbol,
                    price,
                    change_pct,
                    volume_ratio,
                    timestamp,
                } => {
                    check_price(price)?;
                    (
                        symbol,
                        EventPayload::Surge {
                            price,
                            change_pct,
                            volume_ratio,
                        },
                        timestamp,
                    )
                }
                MarketSignal::Pattern {
                    symbol,
                    name,
                    confidence,
                    timeframe,
                    timestamp,
                } => (
                    symbol,
                    EventPayload::Pattern {
                        name,
                        confidence,
                        timeframe,
                    },
                    timestamp,
                ),
            };

            Ok(Classified {
                event: Event {
                    sequence,
                    symbol,
                    payload,
                    produced_at,
                },
                delta: None,
            })
        }
    }
}

// Typed values built through constructors already satisfy these; values
// deserialized or assembled elsewhere are checked again here.
fn check_symbol(symbol: &Symbol) -> Result<(), IngestError> {
    if symbol.as_str().trim().is_empty() {
        return Err(IngestError::EmptySymbol);
    }
    Ok(())
}

fn check_price(price: Price) -> Result<(), IngestError> {
    if price.as_decimal() <= Decimal::ZERO {
        return Err(ValueError::NonPositivePrice(price.to_string()).into());
    }
    Ok(())
}

fn check_volume(volume: Volume) -> Result<(), IngestError> {
    if volume.as_decimal() < Decimal::ZERO {
        return Err(ValueError::NegativeVolume(volume.to_string()).into());
    }
    if volume.as_decimal() > Decimal::from(MAX_TICK_VOLUME) {
        return Err(ValueError::VolumeTooLarge(volume.to_string()).into());
    }
    Ok(())
}

fn check_timestamp(timestamp: i64) -> Result<(), IngestError> {
    if timestamp <= 0 {
        return Err(IngestError::InvalidTimestamp(timestamp));
    }
    Ok(())
}

/// Single entry point for everything the upstream detector produces.
pub struct IngestAdapter {
    events: EventPublisher,
    deltas: DeltaQueue,
    /// Last assigned sequence; the first event gets 1.
    sequence: AtomicU64,
    metrics: Arc<ServiceMetrics>,
}

impl IngestAdapter {
    pub fn new(events: EventPublisher, deltas: DeltaQueue, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            events,
            deltas,
            sequence: AtomicU64::new(0),
            metrics,
        }
    }

    /// Accept one tick or signal. Returns the sequence assigned to it.
    ///
    /// Rejected input is counted and logged, and never reaches the buffer
    /// or the persistence queue.
    pub fn on_incoming(&self, inbound: impl Into<Inbound>) -> Result<u64, IngestError> {
        let inbound = inbound.into();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let classified = match classify(inbound, sequence) {
            Ok(classified) => classified,
            Err(err) => {
                self.metrics.record_event_rejected();
                warn!(sequence, error = %err, "Rejected inbound value");
                return Err(err);
            }
        };

        debug!(
            sequence,
            category = %classified.event.category(),
            symbol = %classified.event.symbol,
            "Event accepted"
        );

        if let Some(delta) = classified.delta {
            self.deltas.enqueue(delta);
        }
        self.events.enqueue(classified.event);
        Ok(sequence)
    }

    /// Last sequence number handed out (0 before the first event).
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}
