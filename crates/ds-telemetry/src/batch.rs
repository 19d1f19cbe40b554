//! Bounded batch queue.

use std::collections::VecDeque;

/// FIFO queue drained in batches of at most `batch_size` items.
#[derive(Debug, Clone)]
pub struct BatchQueue<T> {
    items: VecDeque<T>,
    batch_size: usize,
}

impl<T> BatchQueue<T> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove up to one batch from the front.
    pub fn take_batch(&mut self) -> Vec<T> {
        let n = self.batch_size.min(self.items.len());
        self.items.drain(..n).collect()
    }
}
