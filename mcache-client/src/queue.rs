//! # Pending Request Queue
//!
//! Purpose: FIFO ledger of requests written on one connection and still
//! waiting for their reply.
//!
//! ## Design Principles
//! 1. **Strict Order**: The protocol answers pipelined commands in order, so
//!    the oldest entry always owns the next reply.
//! 2. **Amortized O(1)**: Dequeue advances a read offset; storage is compacted
//!    once more than half of it has been consumed.
//! 3. **Single Owner**: Only the task driving the connection touches it.

/// Ordered queue with offset-based removal.
#[derive(Debug)]
pub struct PendingQueue<T> {
    storage: Vec<Option<T>>,
    offset: usize,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        PendingQueue::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        PendingQueue {
            storage: Vec::new(),
            offset: 0,
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.storage.push(Some(item));
    }

    /// Removes and returns the oldest entry.
    pub fn dequeue(&mut self) -> Option<T> {
        let item = self.storage.get_mut(self.offset)?.take();
        self.offset += 1;
        if self.offset * 2 > self.storage.len() {
            self.storage.drain(..self.offset);
            self.offset = 0;
        }
        item
    }

    /// Oldest entry, left in place.
    pub fn peek(&self) -> Option<&T> {
        self.storage.get(self.offset).and_then(Option::as_ref)
    }

    /// Number of outstanding entries.
    pub fn count(&self) -> usize {
        self.storage.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let items = self.storage.drain(self.offset..).flatten().collect();
        self.storage.clear();
        self.offset = 0;
        items
    }

    #[cfg(test)]
    fn backing_len(&self) -> usize {
        self.storage.len()
    }
}
