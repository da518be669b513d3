use std::collections::VecDeque;

use crate::types::LogItem;

/// Default number of log entries replayed to new observers.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Bounded FIFO of log entries; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct LogRing {
    items: VecDeque<LogItem>,
    capacity: usize,
}

impl LogRing {
    /// Create a ring with a capacity of at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: LogItem) {
        self.items.push_back(item);
        self.trim_to_capacity();
    }

    /// Retained entries in insertion order.
    pub fn list(&self) -> Vec<LogItem> {
        self.items.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn trim_to_capacity(&mut self) {
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
