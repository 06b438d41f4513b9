//! Prime-mapp data distribution.
//!
//! Distributes page blocks with a two-phase round-robin over a period of
//! `P = 3N/2` blocks: the first `N` blocks of each period go to nodes in
//! id order, the remainder rebalance over the nodes with a rotating start.
//! The local offset has no closed form in the second phase; it is found by
//! walking backwards block by block and counting earlier blocks that
//! resolved to the same home. The walk terminates at the initial linear
//! region (`addr <= N * block`) or at a phase-two block of the same home.

use super::{check_homenode, check_offset};
use crate::layout::{align_backwards, Layout, PAGE_SIZE};

pub(crate) struct PrimeMapp {
    nodes: usize,
    size_per_node: usize,
    page_block: usize,
    prime: usize,
}

impl PrimeMapp {
    pub fn new(layout: &Layout) -> Self {
        PrimeMapp {
            nodes: layout.nodes,
            size_per_node: layout.size_per_node,
            page_block: layout.page_block,
            prime: (3 * layout.nodes) / 2,
        }
    }

    fn homenode_of_block(&self, pagenum: usize) -> usize {
        if pagenum % self.prime >= self.nodes {
            ((pagenum / self.prime) * (self.prime - self.nodes)
                + (pagenum % self.prime - self.nodes))
                % self.nodes
        } else {
            pagenum % self.prime
        }
    }

    pub fn homenode(&self, offset: usize) -> usize {
        let addr = align_backwards(offset, PAGE_SIZE);
        let pagenum = addr / self.page_block;
        check_homenode(self.homenode_of_block(pagenum), self.nodes)
    }

    pub fn local_offset(&self, offset: usize) -> usize {
        let drift = offset % PAGE_SIZE;
        let mut addr = align_backwards(offset, PAGE_SIZE);
        let pagenum = addr / self.page_block;

        let local = if addr <= self.nodes * self.page_block
            || pagenum % self.prime >= self.nodes
        {
            pagenum / self.nodes * self.page_block + addr % self.page_block + drift
        } else {
            let real_home = self.homenode_of_block(pagenum);
            let mut home_counter = 0;
            addr -= self.page_block;
            loop {
                let walk_pagenum = addr / self.page_block;
                let walk_home = self.homenode_of_block(walk_pagenum);
                if walk_home == real_home {
                    home_counter += 1;
                }
                if walk_home == real_home
                    && (addr <= self.nodes * self.page_block
                        || walk_pagenum % self.prime >= self.nodes)
                {
                    break walk_pagenum / self.nodes * self.page_block
                        + addr % self.page_block
                        + home_counter * self.page_block
                        + drift;
                }
                addr -= self.page_block;
            }
        };
        check_offset(local, self.size_per_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_layout_with_policy;
    use crate::env::Policy;

    fn prime4() -> (Layout, PrimeMapp) {
        let layout = test_layout_with_policy(4, 1 << 22, Policy::PrimeMapp);
        let mapp = PrimeMapp::new(&layout);
        (layout, mapp)
    }

    #[test]
    fn test_two_phase_home_sequence() {
        let (layout, mapp) = prime4();
        let block = layout.page_block;
        // Period is P = 6: four direct blocks, then two rebalanced with a
        // start rotating by P - N per period.
        let homes: Vec<usize> = (0..12).map(|p| mapp.homenode(p * block)).collect();
        assert_eq!(homes, vec![0, 1, 2, 3, 0, 1, 0, 1, 2, 3, 2, 3]);
    }

    #[test]
    fn test_backward_walk_packs_offsets_densely() {
        let (layout, mapp) = prime4();
        let block = layout.page_block;
        // Node 0 hosts blocks 0, 4 and 6 of the first two periods, in that
        // order inside its share.
        assert_eq!(mapp.local_offset(0), 0);
        assert_eq!(mapp.local_offset(4 * block), block);
        assert_eq!(mapp.local_offset(6 * block + 17), 2 * block + 17);
        // Node 2 hosts blocks 2, 8 and 10.
        assert_eq!(mapp.local_offset(2 * block), 0);
        assert_eq!(mapp.local_offset(8 * block), block);
        assert_eq!(mapp.local_offset(10 * block), 2 * block);
    }

    #[test]
    fn test_offsets_are_injective_per_home() {
        let (layout, mapp) = prime4();
        let block = layout.page_block;
        let blocks = layout.total_size / block;
        let mut seen = std::collections::HashSet::new();
        for p in 0..blocks {
            let home = mapp.homenode(p * block);
            let local = mapp.local_offset(p * block);
            assert!(local < layout.size_per_node);
            assert_eq!(local % block, 0);
            assert!(seen.insert((home, local)), "block {p} collides");
        }
    }

    #[test]
    fn test_odd_node_count() {
        let layout = test_layout_with_policy(3, 1 << 21, Policy::PrimeMapp);
        let mapp = PrimeMapp::new(&layout);
        let block = layout.page_block;
        let blocks = layout.total_size / block;
        let mut seen = std::collections::HashSet::new();
        for p in 0..blocks {
            let home = mapp.homenode(p * block);
            let local = mapp.local_offset(p * block);
            assert!(home < 3);
            assert!(local < layout.size_per_node);
            assert!(seen.insert((home, local)));
        }
    }
}
