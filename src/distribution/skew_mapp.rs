//! Skew-mapp data distribution.
//!
//! Round-robin like the cyclic distribution, but skips ahead one node for
//! every N blocks placed, which breaks up pathological stride patterns.

use super::{check_homenode, check_offset};
use crate::layout::{align_backwards, Layout, PAGE_SIZE};

pub(crate) struct SkewMapp {
    nodes: usize,
    size_per_node: usize,
    page_block: usize,
}

impl SkewMapp {
    pub fn new(layout: &Layout) -> Self {
        SkewMapp {
            nodes: layout.nodes,
            size_per_node: layout.size_per_node,
            page_block: layout.page_block,
        }
    }

    pub fn homenode(&self, offset: usize) -> usize {
        let addr = align_backwards(offset, PAGE_SIZE);
        let pagenum = addr / self.page_block;
        check_homenode(
            (pagenum + pagenum / self.nodes + 1) % self.nodes,
            self.nodes,
        )
    }

    pub fn local_offset(&self, offset: usize) -> usize {
        let drift = offset % PAGE_SIZE;
        let addr = align_backwards(offset, PAGE_SIZE);
        let pagenum = addr / self.page_block;
        let local = pagenum / self.nodes * self.page_block + addr % self.page_block + drift;
        check_offset(local, self.size_per_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_layout;

    #[test]
    fn test_skips_one_node_per_round() {
        let layout = test_layout(4, 1 << 22);
        let skew = SkewMapp::new(&layout);
        let block = layout.page_block;

        // First round: 1, 2, 3, 0. Second round starts at 2, not 1.
        assert_eq!(skew.homenode(0), 1);
        assert_eq!(skew.homenode(block), 2);
        assert_eq!(skew.homenode(2 * block), 3);
        assert_eq!(skew.homenode(3 * block), 0);
        assert_eq!(skew.homenode(4 * block), 2);
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let layout = test_layout(4, 1 << 21);
        let skew = SkewMapp::new(&layout);
        for offset in (0..layout.total_size).step_by(PAGE_SIZE) {
            assert!(skew.homenode(offset) < 4);
            assert!(skew.local_offset(offset) < layout.size_per_node);
        }
    }
}
