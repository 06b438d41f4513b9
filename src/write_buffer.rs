//! Write buffer: dirty cache lines awaiting write-back.
//!
//! A FIFO of cache indices with the ability to erase any element while
//! preserving order. At most one entry exists per cache line, and an entry
//! implies the line is dirty. When the buffer is full, adding evicts the
//! oldest `write_back_size` entries; a release or barrier drains it whole.
//!
//! Batches are sorted by cache index before they are handed out: write-back
//! opens one data-window session per home node and closes it only after the
//! whole batch, so locality of the batch directly bounds session churn.
//!
//! The buffer mutex is only ever held for queue surgery; the caller
//! performs the actual write-back with the batch already popped, so the
//! mutex is never held across remote operations.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub(crate) struct WriteBuffer {
    buffer: Mutex<VecDeque<usize>>,
    /// Maximum number of entries.
    max_size: usize,
    /// Entries evicted per overflow.
    write_back_size: usize,
}

impl WriteBuffer {
    pub fn new(max_size: usize, write_back_size: usize) -> Self {
        WriteBuffer {
            buffer: Mutex::new(VecDeque::new()),
            max_size,
            write_back_size: write_back_size.min(max_size).max(1),
        }
    }

    /// Add a cache line, deduplicating.
    ///
    /// Returns a sorted batch of evicted entries when the buffer was full;
    /// the caller must write those lines back before releasing the
    /// transport. The new entry is appended either way.
    #[must_use]
    pub fn add(&self, index: usize) -> Option<Vec<usize>> {
        let mut buffer = self.buffer.lock();
        if buffer.contains(&index) {
            return None;
        }
        let batch = if buffer.len() >= self.max_size {
            let mut batch: Vec<usize> = buffer.drain(..self.write_back_size).collect();
            batch.sort_unstable();
            Some(batch)
        } else {
            None
        };
        buffer.push_back(index);
        batch
    }

    /// Remove a cache line if present. Idempotent.
    pub fn erase(&self, index: usize) {
        let mut buffer = self.buffer.lock();
        if let Some(position) = buffer.iter().position(|&entry| entry == index) {
            buffer.remove(position);
        }
    }

    /// Drain the whole buffer, sorted by cache index.
    #[must_use]
    pub fn take_all(&self) -> Vec<usize> {
        let mut batch: Vec<usize> = self.buffer.lock().drain(..).collect();
        batch.sort_unstable();
        batch
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_deduplicates() {
        let buffer = WriteBuffer::new(8, 2);
        assert!(buffer.add(3).is_none());
        assert!(buffer.add(3).is_none());
        assert!(buffer.add(5).is_none());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_erase_is_idempotent_and_keeps_order() {
        let buffer = WriteBuffer::new(8, 2);
        for index in [4, 1, 9, 2] {
            let _ = buffer.add(index);
        }
        buffer.erase(9);
        buffer.erase(9);
        assert_eq!(buffer.len(), 3);
        // Drain is sorted regardless of insertion order.
        assert_eq!(buffer.take_all(), vec![1, 2, 4]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest_sorted() {
        let buffer = WriteBuffer::new(4, 2);
        for index in [7, 3, 9, 5] {
            assert!(buffer.add(index).is_none());
        }
        // Full: the next add pops the two oldest (7, 3), sorted.
        let batch = buffer.add(1).expect("overflow batch");
        assert_eq!(batch, vec![3, 7]);
        // Remaining entries keep FIFO order with the new entry appended.
        assert_eq!(buffer.take_all(), vec![1, 5, 9]);
    }

    #[test]
    fn test_bound_is_respected() {
        let buffer = WriteBuffer::new(4, 2);
        for index in 0..100 {
            let _ = buffer.add(index);
            assert!(buffer.len() <= 4);
        }
    }

    #[test]
    fn test_write_back_size_clamped() {
        let buffer = WriteBuffer::new(2, 50);
        assert!(buffer.add(0).is_none());
        assert!(buffer.add(1).is_none());
        let batch = buffer.add(2).expect("overflow batch");
        // Clamped to the buffer size: everything old is evicted.
        assert_eq!(batch, vec![0, 1]);
        assert_eq!(buffer.take_all(), vec![2]);
    }
}
