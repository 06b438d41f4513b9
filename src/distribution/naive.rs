//! Naive data distribution.
//!
//! Each node provides an equally-sized chunk of global memory, and the
//! chunks are concatenated in node id order to form the address space.

use super::{check_homenode, check_offset};
use crate::layout::Layout;

pub(crate) struct Naive {
    nodes: usize,
    size_per_node: usize,
}

impl Naive {
    pub fn new(layout: &Layout) -> Self {
        Naive {
            nodes: layout.nodes,
            size_per_node: layout.size_per_node,
        }
    }

    pub fn homenode(&self, offset: usize) -> usize {
        check_homenode(offset / self.size_per_node, self.nodes)
    }

    pub fn local_offset(&self, offset: usize) -> usize {
        check_offset(
            offset - self.homenode(offset) * self.size_per_node,
            self.size_per_node,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_layout;

    #[test]
    fn test_chunks_concatenate_in_id_order() {
        let layout = test_layout(4, 1 << 20);
        let naive = Naive::new(&layout);
        let per_node = layout.size_per_node;

        assert_eq!(naive.homenode(0), 0);
        assert_eq!(naive.homenode(per_node - 1), 0);
        assert_eq!(naive.homenode(per_node), 1);
        assert_eq!(naive.homenode(3 * per_node + 7), 3);

        assert_eq!(naive.local_offset(0), 0);
        assert_eq!(naive.local_offset(per_node + 5), 5);
        assert_eq!(naive.local_offset(3 * per_node + 7), 7);
    }

    #[test]
    #[should_panic(expected = "home node")]
    fn test_out_of_space_offset_panics() {
        let layout = test_layout(2, 1 << 20);
        let naive = Naive::new(&layout);
        naive.homenode(layout.total_size);
    }
}
