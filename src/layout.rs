//! Derived size parameters shared by every component.
//!
//! All distribution, directory and cache arithmetic operates on the values
//! computed here, so they are derived exactly once from the configuration
//! and then treated as immutable for the life of the process.

use crate::env::{Config, Policy};

/// Granularity of the coherence protocol: one OS page.
pub const PAGE_SIZE: usize = 4096;

/// Number of contiguous pages forming one coherence unit.
pub const CACHELINE: usize = 1;

/// Align `value` down to a multiple of `size`.
#[inline]
pub const fn align_backwards(value: usize, size: usize) -> usize {
    (value / size) * size
}

/// Align `value` up to a multiple of `size` (zero stays zero).
#[inline]
pub const fn align_forwards(value: usize, size: usize) -> usize {
    if value == 0 {
        0
    } else {
        (1 + (value - 1) / size) * size
    }
}

/// All derived sizes for one run. Identical on every node.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Number of cooperating nodes.
    pub nodes: usize,
    /// Total size of the global address space in bytes.
    pub total_size: usize,
    /// Each node's authoritative share of the global address space.
    pub size_per_node: usize,
    /// Size of one coherence unit in bytes.
    pub block_size: usize,
    /// Local page cache size in pages.
    pub cache_pages: usize,
    /// Number of words in the classification ring (two per tracked unit).
    pub classification_size: usize,
    /// Page block size in bytes for the cyclic policy family.
    pub page_block: usize,
    /// Active distribution policy.
    pub policy: Policy,
    /// Sentinel marking an empty cache tag or an unclaimed directory field.
    pub tag_none: usize,
}

impl Layout {
    /// Derive the run layout from the configuration.
    pub fn new(config: &Config) -> Self {
        let nodes = config.node_count;
        let block_size = PAGE_SIZE * CACHELINE;
        let page_block = config.allocation_block_size * PAGE_SIZE;

        // Standardise the memory space: at least one page per node, and a
        // whole number of coherence units on every node. The cyclic policy
        // family packs whole page blocks per node and per round, so its
        // rounds must divide the space exactly or the last round would
        // overflow a node's share; prime-mapp additionally needs complete
        // rotation cycles of its two-phase period.
        let align_unit = match config.policy {
            Policy::Naive | Policy::FirstTouch => block_size * nodes,
            Policy::Cyclic | Policy::SkewMapp => page_block * nodes,
            Policy::PrimeMapp => page_block * (3 * nodes / 2) * nodes,
        };
        let mut total_size = config.memory_size.max(PAGE_SIZE * nodes);
        total_size = align_forwards(total_size, align_unit);

        // Round the cache to whole coherence units, cap it at the memory
        // size, and require at least two units to prevent endless eviction
        // loops on a single slot.
        let mut cache_bytes = config.cache_size.min(total_size);
        cache_bytes = align_forwards(cache_bytes, block_size);
        cache_bytes = cache_bytes.max(block_size * 2);
        let cache_pages = cache_bytes / PAGE_SIZE;

        Layout {
            nodes,
            total_size,
            size_per_node: total_size / nodes,
            block_size,
            cache_pages,
            classification_size: 2 * cache_pages,
            page_block,
            policy: config.policy,
            tag_none: total_size + 1,
        }
    }

    /// Cache slot index backing a global byte offset.
    #[inline]
    pub fn cache_index(&self, offset: usize) -> usize {
        (offset / PAGE_SIZE) % self.cache_pages
    }

    /// Index of the sharer word for a global byte offset; the writer word
    /// immediately follows it.
    #[inline]
    pub fn classification_index(&self, offset: usize) -> usize {
        (2 * (offset / self.block_size)) % self.classification_size
    }

    /// Number of pages in the global address space.
    #[inline]
    pub fn total_pages(&self) -> usize {
        self.total_size / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(nodes: usize, memory: usize, cache: usize) -> Config {
        Config {
            memory_size: memory,
            cache_size: cache,
            write_buffer_size: 512,
            write_buffer_write_back_size: 32,
            policy: Policy::Naive,
            allocation_block_size: 16,
            print_statistics: false,
            node_id: 0,
            node_count: nodes,
            exchange_path: None,
        }
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_backwards(8191, 4096), 4096);
        assert_eq!(align_forwards(8191, 4096), 8192);
        assert_eq!(align_forwards(8192, 4096), 8192);
        assert_eq!(align_forwards(0, 4096), 0);
    }

    #[test]
    fn test_total_size_rounds_to_node_multiple() {
        let layout = Layout::new(&config(4, (1 << 20) + 1, 1 << 20));
        assert_eq!(layout.total_size % (layout.block_size * 4), 0);
        assert_eq!(layout.size_per_node * 4, layout.total_size);
    }

    #[test]
    fn test_cache_minimum_two_units() {
        let layout = Layout::new(&config(2, 1 << 20, 0));
        assert_eq!(layout.cache_pages, 2 * CACHELINE);
    }

    #[test]
    fn test_cache_capped_at_memory() {
        let layout = Layout::new(&config(2, 1 << 20, 1 << 30));
        assert!(layout.cache_pages * PAGE_SIZE <= layout.total_size);
    }

    #[test]
    fn test_classification_ring_wraps() {
        let layout = Layout::new(&config(2, 1 << 24, 1 << 20));
        let idx = layout.classification_index(0);
        assert_eq!(idx, 0);
        // One full ring later the same word is reused.
        let wrap = layout.classification_index(layout.cache_pages * PAGE_SIZE);
        assert_eq!(wrap, 0);
        // Adjacent units use adjacent word pairs.
        assert_eq!(layout.classification_index(layout.block_size), 2);
    }
}
