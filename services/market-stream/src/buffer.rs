//! Per-category event buffer
//!
//! Fixed-capacity FIFO per category with drop-oldest overflow. The buffer
//! is split at construction into a cloneable [`EventPublisher`] for the
//! ingest side and a single [`EventDrain`] owned by the distributor, so
//! there is exactly one consumer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;
use types::event::{Category, Event};

use crate::metrics::ServiceMetrics;
use crate::queue::BoundedQueue;

struct CategoryRing {
    queue: BoundedQueue<Event>,
    /// Set once an overflow has been logged; cleared on drain.
    overflow_logged: AtomicBool,
}

struct Shared {
    rings: [CategoryRing; 5],
    metrics: Arc<ServiceMetrics>,
}

impl Shared {
    fn ring(&self, category: Category) -> &CategoryRing {
        &self.rings[category.index()]
    }
}

/// Constructor for the publisher/drain pair.
pub struct EventBuffer;

impl EventBuffer {
    /// Create a buffer holding up to `capacity` events per category.
    pub fn new(capacity: usize, metrics: Arc<ServiceMetrics>) -> (EventPublisher, EventDrain) {
        let rings = Category::ALL.map(|_| CategoryRing {
            queue: BoundedQueue::new(capacity),
            overflow_logged: AtomicBool::new(false),
        });
        let shared = Arc::new(Shared { rings, metrics });
        (
            EventPublisher {
                shared: Arc::clone(&shared),
            },
            EventDrain { shared },
        )
    }
}

/// Producer side. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct EventPublisher {
    shared: Arc<Shared>,
}

impl EventPublisher {
    /// Append an event to its category, evicting the oldest on overflow.
    pub fn enqueue(&self, event: Event) {
        let category = event.category();
        let ring = self.shared.ring(category);
        let evicted = ring.queue.push(event);
        self.shared.metrics.record_event_enqueued(evicted.is_some());

        if let Some(old) = evicted {
            if !ring.overflow_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    category = %category,
                    capacity = ring.queue.capacity(),
                    evicted_sequence = old.sequence,
                    "Event buffer overflow, dropping oldest"
                );
            }
        }
    }

    pub fn len(&self, category: Category) -> usize {
        self.shared.ring(category).queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.rings[0].queue.capacity()
    }

    /// Events evicted from `category` since creation.
    pub fn dropped(&self, category: Category) -> u64 {
        self.shared.ring(category).queue.dropped()
    }
}

/// Consumer side. Not cloneable; owned by the distributor.
pub struct EventDrain {
    shared: Arc<Shared>,
}

impl EventDrain {
    /// Empty every category and return the contents in insertion order.
    ///
    /// Categories with nothing buffered are omitted from the map.
    pub fn drain_all(&mut self) -> BTreeMap<Category, Vec<Event>> {
        let mut drained = BTreeMap::new();
        for category in Category::ALL {
            let ring = self.shared.ring(category);
            let events = ring.queue.drain_present();
            ring.overflow_logged.store(false, Ordering::Relaxed);
            if !events.is_empty() {
                drained.insert(category, events);
            }
        }
        drained
    }

    pub fn len(&self, category: Category) -> usize {
        self.shared.ring(category).queue.len()
    }

    pub fn total_len(&self) -> usize {
        self.shared.rings.iter().map(|r| r.queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn dropped(&self, category: Category) -> u64 {
        self.shared.ring(category).queue.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use types::event::EventPayload;
    use types::ids::Symbol;
    use types::numeric::{Price, Volume};

    fn tick(seq: u64) -> Event {
        Event {
            sequence: seq,
            symbol: Symbol::new("AAPL"),
            payload: EventPayload::Tick {
                price: Price::from_u64(190),
                volume: Volume::from_u64(10),
            },
            produced_at: 1708123456789000000 + seq as i64,
        }
    }

    fn surge(seq: u64) -> Event {
        Event {
            sequence: seq,
            symbol: Symbol::new("AMD"),
            payload: EventPayload::Surge {
                price: Price::from_u64(150),
                change_pct: Decimal::new(32, 1),
                volume_ratio: Decimal::new(4, 0),
            },
            produced_at: 1708123456789000000 + seq as i64,
        }
    }

    fn buffer(capacity: usize) -> (EventPublisher, EventDrain, Arc<ServiceMetrics>) {
        let metrics = Arc::new(ServiceMetrics::new());
        let (publisher, drain) = EventBuffer::new(capacity, Arc::clone(&metrics));
        (publisher, drain, metrics)
    }

    #[test]
    fn test_categories_are_independent() {
        let (publisher, mut drain, _) = buffer(2);
        publisher.enqueue(tick(1));
        publisher.enqueue(surge(2));
        publisher.enqueue(surge(3));
        publisher.enqueue(surge(4));

        assert_eq!(publisher.len(Category::Tick), 1);
        assert_eq!(publisher.len(Category::Surge), 2);
        assert_eq!(publisher.dropped(Category::Tick), 0);
        assert_eq!(publisher.dropped(Category::Surge), 1);

        let drained = drain.drain_all();
        assert_eq!(drained[&Category::Tick].len(), 1);
        let surge_seqs: Vec<u64> = drained[&Category::Surge].iter().map(|e| e.sequence).collect();
        assert_eq!(surge_seqs, vec![3, 4]);
    }

    #[test]
    fn test_drain_all_preserves_order_and_empties() {
        let (publisher, mut drain, metrics) = buffer(100);
        for seq in 1..=50 {
            publisher.enqueue(tick(seq));
        }

        let drained = drain.drain_all();
        let seqs: Vec<u64> = drained[&Category::Tick].iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
        assert!(drain.is_empty());
        assert!(drain.drain_all().is_empty());
        assert_eq!(metrics.export()["events_enqueued"], 50);
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        let (publisher, drain, metrics) = buffer(10);
        for seq in 0..1000 {
            publisher.enqueue(tick(seq));
            assert!(publisher.len(Category::Tick) <= 10);
        }
        assert_eq!(drain.dropped(Category::Tick), 990);
        assert_eq!(metrics.export()["events_dropped"], 990);
    }

    #[test]
    fn test_publisher_clones_share_storage() {
        let (publisher, mut drain, _) = buffer(10);
        let other = publisher.clone();
        publisher.enqueue(tick(1));
        other.enqueue(tick(2));

        assert_eq!(drain.drain_all()[&Category::Tick].len(), 2);
        assert_eq!(publisher.capacity(), 10);
    }
}
