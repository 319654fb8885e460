//! Bounded change queue with oldest-first eviction.

use std::collections::VecDeque;

/// Fixed-capacity FIFO. Pushing into a full queue evicts the oldest item.
///
/// The queue is not synchronized; the sampler keeps it behind its state lock.
#[derive(Debug, Clone)]
pub struct ChangeQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> ChangeQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append an item, returning the evicted item if the queue was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Remove and return up to `n` of the oldest items, in FIFO order.
    pub fn pop_up_to(&mut self, n: usize) -> Vec<T> {
        let take = n.min(self.items.len());
        self.items.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted by overflow since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Discard every queued item. Does not count as a drop.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
