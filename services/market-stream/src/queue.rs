//! Bounded drop-oldest ring used by both intake paths
//!
//! Producers never block and never fail: when the ring is full the oldest
//! entry is evicted to make room. Any number of producers may push; one
//! consumer drains.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

/// Lock-free bounded queue with drop-oldest overflow.
pub struct BoundedQueue<T> {
    ring: ArrayQueue<T>,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    /// Panics if `capacity` is zero; configuration validation rejects that first.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an item, returning the evicted oldest item if the ring was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = self.ring.force_push(item);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Pop up to `max` items in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.ring.len()));
        while out.len() < max {
            match self.ring.pop() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    /// Pop everything present when the call starts.
    ///
    /// Items pushed concurrently may or may not be included, but the call
    /// never takes more than the starting length, so a busy producer cannot
    /// keep it looping.
    pub fn drain_present(&self) -> Vec<T> {
        self.drain(self.ring.len())
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Total items evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_within_capacity() {
        let queue = BoundedQueue::new(3);
        assert!(queue.push(1).is_none());
        assert!(queue.push(2).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), Some(1));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain_present(), vec![2, 3]);
    }

    #[test]
    fn test_drain_respects_max() {
        let queue = BoundedQueue::new(10);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.drain(2), vec![0, 1]);
        assert_eq!(queue.drain(10), vec![2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_accounting_matches_overflow() {
        let queue = BoundedQueue::new(100);
        for i in 0..250 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.dropped(), 150);
        assert_eq!(queue.drain_present().first(), Some(&150));
    }

    #[test]
    fn test_concurrent_producers_stay_bounded() {
        let queue = Arc::new(BoundedQueue::new(64));
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        queue.push(p * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 64);
        assert_eq!(queue.dropped(), 4000 - 64);
    }
}
