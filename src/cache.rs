//! Local page cache.
//!
//! A fixed, direct-mapped cache of coherence units fetched from remote
//! homes. Each line carries its protocol state, a dirty flag, the global
//! offset it holds and a twin page: the snapshot taken when the line first
//! became dirty, diffed against the live contents at flush time.
//!
//! The cache itself is raw memory (the linear view of the cache backing
//! file); this module owns only the control data. Everything here is
//! protected by the runtime's cache mutex, which is always acquired before
//! the transport serialization point.

use crate::layout::{Layout, CACHELINE, PAGE_SIZE};
use crate::transport::DataWindows;
use std::ptr::NonNull;

/// Coherence state of one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineState {
    /// No usable contents; the next access loads remotely.
    Invalid,
    /// Holds a coherent copy of the tagged unit.
    Valid,
}

/// Dirtiness of one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dirtiness {
    Clean,
    Dirty,
}

/// Control data for one cache line.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheLine {
    pub state: LineState,
    pub dirty: Dirtiness,
    /// Global byte offset of the unit held, or the `tag_none` sentinel.
    pub tag: usize,
}

/// Control state of the whole cache.
pub(crate) struct PageCache {
    pub lines: Vec<CacheLine>,
    /// Whether a line was touched since the last self-invalidation epoch.
    pub touched: Vec<bool>,
    /// Twin storage, one page per cache page.
    twins: Box<[u8]>,
    /// Linear read-write view of the cache backing file.
    data: NonNull<u8>,
    /// Open put sessions towards remote homes.
    pub windows: DataWindows,
}

impl PageCache {
    pub fn new(layout: &Layout, data: NonNull<u8>, nodes: usize) -> Self {
        PageCache {
            lines: vec![
                CacheLine {
                    state: LineState::Invalid,
                    dirty: Dirtiness::Clean,
                    tag: layout.tag_none,
                };
                layout.cache_pages
            ],
            touched: vec![false; layout.cache_pages],
            twins: vec![0u8; layout.cache_pages * PAGE_SIZE].into_boxed_slice(),
            data,
            windows: DataWindows::new(nodes),
        }
    }

    /// Pointer to cache page `index` in the linear view.
    #[inline]
    pub fn data_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.lines.len());
        // SAFETY: index checked against the cache size.
        unsafe { self.data.as_ptr().add(index * PAGE_SIZE) }
    }

    /// The twin page of cache page `index`.
    #[inline]
    pub fn twin(&self, index: usize) -> &[u8] {
        &self.twins[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
    }

    /// Snapshot one coherence unit from `src` into the twins of the lines
    /// starting at `index`.
    ///
    /// # Safety
    ///
    /// `src` must be readable for a whole coherence unit.
    pub unsafe fn snapshot_twin(&mut self, index: usize, src: *const u8) {
        let dst = &mut self.twins[index * PAGE_SIZE..(index + CACHELINE) * PAGE_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }
}

// SAFETY: the raw cache view aliases shared memory whose access is guarded
// by the cache mutex; control data is plain owned state.
unsafe impl Send for PageCache {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Policy;
    use crate::test_support::test_layout_with_policy;

    #[test]
    fn test_lines_start_invalid_and_untagged() {
        let layout = test_layout_with_policy(1, 1 << 20, Policy::Naive);
        let mut backing = vec![0u8; layout.cache_pages * PAGE_SIZE];
        let data = NonNull::new(backing.as_mut_ptr()).unwrap();
        let cache = PageCache::new(&layout, data, 1);

        assert_eq!(cache.lines.len(), layout.cache_pages);
        for line in &cache.lines {
            assert_eq!(line.state, LineState::Invalid);
            assert_eq!(line.dirty, Dirtiness::Clean);
            assert_eq!(line.tag, layout.tag_none);
        }
        assert!(cache.touched.iter().all(|t| !t));
    }

    #[test]
    fn test_twin_snapshot_copies_unit() {
        let layout = test_layout_with_policy(1, 1 << 20, Policy::Naive);
        let mut backing = vec![0u8; layout.cache_pages * PAGE_SIZE];
        backing[3 * PAGE_SIZE] = 42;
        backing[4 * PAGE_SIZE - 1] = 7;
        let data = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mut cache = PageCache::new(&layout, data, 1);

        unsafe { cache.snapshot_twin(3, cache.data_ptr(3)) };
        assert_eq!(cache.twin(3)[0], 42);
        assert_eq!(cache.twin(3)[PAGE_SIZE - 1], 7);
        assert_eq!(cache.twin(2)[0], 0);
    }
}
