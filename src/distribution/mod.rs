//! Data-distribution policies.
//!
//! A policy answers one question: for a byte offset in the global address
//! space, which node backs it (`homenode`) and where inside that node's
//! share does it live (`local_offset`)? The first four policies are pure
//! arithmetic over the run layout; first-touch keeps distributed state in
//! the exchange segment.
//!
//! The active policy is fixed at init from `ARGO_ALLOCATION_POLICY` and
//! never changes for the life of the run: the answers must be identical on
//! every node, at every time.

mod cyclic;
mod first_touch;
mod global_ptr;
mod naive;
mod prime_mapp;
mod skew_mapp;

pub use global_ptr::GlobalPtr;

pub(crate) use cyclic::Cyclic;
pub(crate) use first_touch::FirstTouch;
pub(crate) use naive::Naive;
pub(crate) use prime_mapp::PrimeMapp;
pub(crate) use skew_mapp::SkewMapp;

use crate::env::Policy;
use crate::layout::Layout;
use crate::transport::Exchange;

/// Policy dispatcher bound to the run layout.
pub(crate) struct Distribution {
    policy: Policy,
    naive: Naive,
    cyclic: Cyclic,
    skew_mapp: SkewMapp,
    prime_mapp: PrimeMapp,
    first_touch: FirstTouch,
}

impl Distribution {
    pub fn new(layout: &Layout, node_id: usize) -> Self {
        Distribution {
            policy: layout.policy,
            naive: Naive::new(layout),
            cyclic: Cyclic::new(layout),
            skew_mapp: SkewMapp::new(layout),
            prime_mapp: PrimeMapp::new(layout),
            first_touch: FirstTouch::new(layout, node_id),
        }
    }

    /// Whether the active policy keeps distributed ownership state.
    pub fn is_first_touch(&self) -> bool {
        self.policy == Policy::FirstTouch
    }

    /// Home node of a global byte offset.
    ///
    /// Panics when a policy produces a node outside `[0, N)`: that is a
    /// protocol invariant violation, not a recoverable condition.
    pub fn homenode(&self, exchange: &Exchange, offset: usize) -> usize {
        match self.policy {
            Policy::Naive => self.naive.homenode(offset),
            Policy::Cyclic => self.cyclic.homenode(offset),
            Policy::SkewMapp => self.skew_mapp.homenode(offset),
            Policy::PrimeMapp => self.prime_mapp.homenode(offset),
            Policy::FirstTouch => self.first_touch.homenode(exchange, offset),
        }
    }

    /// Offset of a global byte inside its home node's share.
    ///
    /// Panics when a policy produces an offset at or beyond `S/N`, like
    /// [`Self::homenode`].
    pub fn local_offset(&self, exchange: &Exchange, offset: usize) -> usize {
        match self.policy {
            Policy::Naive => self.naive.local_offset(offset),
            Policy::Cyclic => self.cyclic.local_offset(offset),
            Policy::SkewMapp => self.skew_mapp.local_offset(offset),
            Policy::PrimeMapp => self.prime_mapp.local_offset(offset),
            Policy::FirstTouch => self.first_touch.local_offset(exchange, offset),
        }
    }
}

/// Panic helper shared by the policies.
#[inline]
pub(crate) fn check_homenode(home: usize, nodes: usize) -> usize {
    assert!(
        home < nodes,
        "distribution produced home node {home} for {nodes} nodes"
    );
    home
}

/// Panic helper shared by the policies.
#[inline]
pub(crate) fn check_offset(offset: usize, size_per_node: usize) -> usize {
    assert!(
        offset < size_per_node,
        "distribution produced local offset {offset:#x} beyond the node share {size_per_node:#x}"
    );
    offset
}
