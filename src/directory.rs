//! Pyxis classification directory.
//!
//! Per coherence unit the directory keeps two words: a bitmask of nodes
//! holding a valid copy (`sharers`) and a bitmask of nodes with a dirty
//! copy (`writers`). Every node owns one array in the exchange segment;
//! the entry on a page's home node is authoritative, entries elsewhere are
//! locally cached approximations reconciled at synchronization points.
//!
//! Remote entries are mutated exclusively through one-sided atomics, so a
//! node never takes another node's locks to classify a page. All
//! operations require the transport serialization point, witnessed by the
//! [`SerializerGuard`] parameter.

use crate::transport::{Exchange, SerializerGuard};
use std::sync::atomic::Ordering;

/// Directory operations for one node.
pub(crate) struct Directory {
    node_id: usize,
}

impl Directory {
    pub fn new(node_id: usize) -> Self {
        Directory { node_id }
    }

    /// Bitmask of this node.
    #[inline]
    pub fn self_bit(&self) -> u64 {
        1u64 << self.node_id
    }

    // ------------------------------------------------------------------
    // Local shard (this node's array)
    // ------------------------------------------------------------------

    /// Sharer mask in the local array.
    #[inline]
    pub fn local_sharers(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        classidx: usize,
    ) -> u64 {
        exchange.directory_word(self.node_id, classidx).load(Ordering::Acquire)
    }

    /// Writer mask in the local array.
    #[inline]
    pub fn local_writers(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        classidx: usize,
    ) -> u64 {
        exchange
            .directory_word(self.node_id, classidx + 1)
            .load(Ordering::Acquire)
    }

    /// OR bits into the local sharer mask, returning the previous mask.
    #[inline]
    pub fn local_or_sharers(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        classidx: usize,
        bits: u64,
    ) -> u64 {
        exchange
            .directory_word(self.node_id, classidx)
            .fetch_or(bits, Ordering::AcqRel)
    }

    /// OR bits into the local writer mask, returning the previous mask.
    #[inline]
    pub fn local_or_writers(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        classidx: usize,
        bits: u64,
    ) -> u64 {
        exchange
            .directory_word(self.node_id, classidx + 1)
            .fetch_or(bits, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------
    // Public operations (one-sided, against any node's array)
    // ------------------------------------------------------------------

    /// One-sided OR into `node`'s sharer mask.
    #[inline]
    pub fn sharers_accumulate(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        node: usize,
        classidx: usize,
        bits: u64,
    ) {
        exchange.directory_word(node, classidx).fetch_or(bits, Ordering::AcqRel);
    }

    /// One-sided OR into `node`'s writer mask.
    #[inline]
    pub fn writers_accumulate(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        node: usize,
        classidx: usize,
        bits: u64,
    ) {
        exchange
            .directory_word(node, classidx + 1)
            .fetch_or(bits, Ordering::AcqRel);
    }

    /// Combined get-and-accumulate on `home`'s entry: OR our bit into the
    /// sharer mask and return `(sharers_before_or, current_writers)`.
    #[inline]
    pub fn sharers_fetch_or(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        home: usize,
        classidx: usize,
        bits: u64,
    ) -> (u64, u64) {
        let old_sharers = exchange.directory_word(home, classidx).fetch_or(bits, Ordering::AcqRel);
        let writers = exchange
            .directory_word(home, classidx + 1)
            .load(Ordering::Acquire);
        (old_sharers, writers)
    }

    /// Combined get-and-accumulate on `home`'s writer word: OR our bit in
    /// and return the mask before the OR.
    #[inline]
    pub fn writers_fetch_or(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        home: usize,
        classidx: usize,
        bits: u64,
    ) -> u64 {
        exchange
            .directory_word(home, classidx + 1)
            .fetch_or(bits, Ordering::AcqRel)
    }

    /// Read `home`'s sharer mask.
    #[inline]
    pub fn sharers_load(
        &self,
        _serial: &SerializerGuard<'_>,
        exchange: &Exchange,
        home: usize,
        classidx: usize,
    ) -> u64 {
        exchange.directory_word(home, classidx).load(Ordering::Acquire)
    }
}

/// The unique node in `mask`, when `mask` has exactly one bit set.
#[inline]
pub(crate) fn single_node_of(mask: u64) -> Option<usize> {
    if mask != 0 && mask.is_power_of_two() {
        Some(mask.trailing_zeros() as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Policy;
    use crate::test_support::test_layout_with_policy;

    #[test]
    fn test_single_node_of() {
        assert_eq!(single_node_of(0), None);
        assert_eq!(single_node_of(0b1), Some(0));
        assert_eq!(single_node_of(0b1000), Some(3));
        assert_eq!(single_node_of(0b1010), None);
    }

    #[test]
    fn test_fetch_or_returns_pre_value() {
        let layout = test_layout_with_policy(1, 1 << 20, Policy::Naive);
        let exchange = Exchange::attach(&layout, 0, false, None).unwrap();
        let dir = Directory::new(0);
        let serial = exchange.serialize();

        let (old_sharers, writers) = dir.sharers_fetch_or(&serial, &exchange, 0, 0, 0b1);
        assert_eq!(old_sharers, 0);
        assert_eq!(writers, 0);

        let (old_sharers, _) = dir.sharers_fetch_or(&serial, &exchange, 0, 0, 0b10);
        assert_eq!(old_sharers, 0b1);
        assert_eq!(dir.local_sharers(&serial, &exchange, 0), 0b11);

        dir.writers_accumulate(&serial, &exchange, 0, 0, 0b100);
        assert_eq!(dir.local_writers(&serial, &exchange, 0), 0b100);
    }
}
