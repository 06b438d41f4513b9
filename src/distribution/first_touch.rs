//! First-touch data distribution.
//!
//! A page is homed on the node that first touches it, subject to each
//! node's backing capacity of `S/N` bytes. Ownership is decided by a
//! compare-exchange on a deterministic third node's directory slice (the
//! `cas_node` of the page), which serializes racing claimants and leaves a
//! single winner; losers spin until the winner has published the claim.
//!
//! Per page the directory holds a `(homenode, offset, ownership)` triple,
//! sentinel-filled until claimed. Every node keeps its own array: the
//! entry on the page's `cas_node` is authoritative, all others are
//! mirrors. Ownership is monotonic; a claim never moves.

use super::{check_homenode, check_offset};
use crate::layout::{align_backwards, Layout, PAGE_SIZE};
use crate::transport::Exchange;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;

pub(crate) struct FirstTouch {
    node_id: usize,
    nodes: usize,
    size_per_node: usize,
    /// Sentinel for every unclaimed directory field.
    null: u64,
    /// Serializes concurrent faults on the same page within this node.
    owners_mutex: Mutex<()>,
}

impl FirstTouch {
    pub fn new(layout: &Layout, node_id: usize) -> Self {
        FirstTouch {
            node_id,
            nodes: layout.nodes,
            size_per_node: layout.size_per_node,
            null: layout.tag_none as u64,
            owners_mutex: Mutex::new(()),
        }
    }

    /// Index of the page's triple inside an owners directory array.
    #[inline]
    fn triple_index(addr: usize) -> usize {
        3 * (addr / PAGE_SIZE)
    }

    /// The deterministic node arbitrating ownership of this page. Note
    /// that this is the home of the directory entry, not of the data.
    #[inline]
    fn cas_node(&self, addr: usize) -> usize {
        (addr / PAGE_SIZE) % self.nodes
    }

    pub fn homenode(&self, exchange: &Exchange, offset: usize) -> usize {
        let addr = align_backwards(offset, PAGE_SIZE);
        let index = Self::triple_index(addr);

        let guard = self.owners_mutex.lock();
        self.update_dirs(exchange, addr);
        // The winner publishes ownership first and the remaining fields
        // after; spin until the mirror carries the real home.
        let mut home;
        loop {
            home = exchange.owners_word(self.node_id, index).load(Ordering::Acquire);
            if home != self.null {
                break;
            }
            std::hint::spin_loop();
        }
        drop(guard);

        check_homenode(home as usize, self.nodes)
    }

    pub fn local_offset(&self, exchange: &Exchange, offset: usize) -> usize {
        let drift = offset % PAGE_SIZE;
        let addr = align_backwards(offset, PAGE_SIZE);
        let index = Self::triple_index(addr);

        let guard = self.owners_mutex.lock();
        self.update_dirs(exchange, addr);
        let mut local;
        loop {
            local = exchange
                .owners_word(self.node_id, index + 1)
                .load(Ordering::Acquire);
            if local != self.null {
                break;
            }
            std::hint::spin_loop();
        }
        drop(guard);

        check_offset(local as usize + drift, self.size_per_node)
    }

    /// Make sure the local mirror carries this page's triple, claiming the
    /// page when nobody has yet.
    fn update_dirs(&self, exchange: &Exchange, addr: usize) {
        let me = self.node_id;
        let index = Self::triple_index(addr);
        let cas_node = self.cas_node(addr);

        if exchange.owners_word(me, index + 2).load(Ordering::Acquire) != self.null {
            return;
        }

        let info = self.load_triple(exchange, cas_node, index);
        if info.iter().all(|&w| w == self.null) {
            self.claim(exchange, addr);
        } else if me != cas_node {
            // Some fields may still be sentinel while the winner is
            // publishing; wait for the complete triple before mirroring.
            let info = self.spin_complete_triple(exchange, cas_node, index);
            self.store_triple(exchange, me, index, info);
        }
    }

    /// Try to claim ownership of the page, or adopt the winner's claim.
    fn claim(&self, exchange: &Exchange, addr: usize) {
        let me = self.node_id;
        let index = Self::triple_index(addr);
        let cas_node = self.cas_node(addr);

        let won = exchange
            .owners_word(cas_node, index + 2)
            .compare_exchange(self.null, me as u64, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            // Walk the nodes starting at ourselves, claiming one page of
            // backing store from the first node with capacity left.
            let mut claimed: Option<(usize, u64)> = None;
            for step in 0..self.nodes {
                let n = (me + step) % self.nodes;
                // Start from the locally cached cursor; the remote CAS
                // corrects it when stale.
                let mut offset = exchange.offsets_word(me, n).load(Ordering::Acquire);
                while offset < self.size_per_node as u64 {
                    let bumped = offset + PAGE_SIZE as u64;
                    match exchange.offsets_word(n, n).compare_exchange(
                        offset,
                        bumped,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            claimed = Some((n, offset));
                            break;
                        }
                        Err(actual) => offset = actual,
                    }
                }
                if n != me {
                    exchange.offsets_word(me, n).store(offset, Ordering::Release);
                }
                if claimed.is_some() {
                    break;
                }
            }

            let (home, offset) = claimed.unwrap_or_else(|| {
                // Capacity is only exhausted when every node's share is
                // full; there is nowhere left to back the page.
                panic!("first-touch found no backing node: all node shares are exhausted")
            });

            let info = [home as u64, offset, me as u64];
            self.store_triple(exchange, me, index, info);
            if me != cas_node {
                self.store_triple(exchange, cas_node, index, info);
            }
        } else if me != cas_node {
            let info = self.spin_complete_triple(exchange, cas_node, index);
            self.store_triple(exchange, me, index, info);
        }
        // A lost race on our own cas_node slice needs no mirroring: the
        // winner publishes straight into the authoritative array, which is
        // also our local one; the callers' spin loops pick it up.
    }

    fn load_triple(&self, exchange: &Exchange, node: usize, index: usize) -> [u64; 3] {
        [
            exchange.owners_word(node, index).load(Ordering::Acquire),
            exchange.owners_word(node, index + 1).load(Ordering::Acquire),
            exchange.owners_word(node, index + 2).load(Ordering::Acquire),
        ]
    }

    fn spin_complete_triple(&self, exchange: &Exchange, node: usize, index: usize) -> [u64; 3] {
        loop {
            let info = self.load_triple(exchange, node, index);
            if info.iter().all(|&w| w != self.null) {
                return info;
            }
            std::hint::spin_loop();
        }
    }

    fn store_triple(&self, exchange: &Exchange, node: usize, index: usize, info: [u64; 3]) {
        // Ownership last: readers treat a non-sentinel ownership word as
        // "triple may be incomplete", and a non-sentinel home/offset as
        // final values.
        exchange.owners_word(node, index).store(info[0], Ordering::Release);
        exchange
            .owners_word(node, index + 1)
            .store(info[1], Ordering::Release);
        exchange
            .owners_word(node, index + 2)
            .store(info[2], Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Policy;
    use crate::test_support::test_layout_with_policy;

    fn single_node() -> (Layout, Exchange, FirstTouch) {
        let layout = test_layout_with_policy(1, 1 << 20, Policy::FirstTouch);
        let exchange = Exchange::attach(&layout, 0, true, None).unwrap();
        let touch = FirstTouch::new(&layout, 0);
        (layout, exchange, touch)
    }

    #[test]
    fn test_touch_order_assigns_dense_offsets() {
        let (_, exchange, touch) = single_node();
        // Touch pages out of address order; offsets follow touch order.
        assert_eq!(touch.homenode(&exchange, 5 * PAGE_SIZE), 0);
        assert_eq!(touch.local_offset(&exchange, 5 * PAGE_SIZE), 0);
        assert_eq!(touch.local_offset(&exchange, 2 * PAGE_SIZE + 9), PAGE_SIZE + 9);
        assert_eq!(touch.local_offset(&exchange, 7 * PAGE_SIZE), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_ownership_is_stable() {
        let (_, exchange, touch) = single_node();
        let first = touch.local_offset(&exchange, 3 * PAGE_SIZE);
        for _ in 0..10 {
            assert_eq!(touch.local_offset(&exchange, 3 * PAGE_SIZE), first);
            assert_eq!(touch.homenode(&exchange, 3 * PAGE_SIZE), 0);
        }
    }

    #[test]
    fn test_racing_claims_have_single_winner() {
        let layout = test_layout_with_policy(2, 1 << 20, Policy::FirstTouch);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ft-exchange").to_str().unwrap().to_string();

        let layout1 = layout.clone();
        let path1 = path.clone();
        let peer = std::thread::spawn(move || {
            let exchange = Exchange::attach(&layout1, 1, true, Some(&path1)).unwrap();
            let touch = FirstTouch::new(&layout1, 1);
            let homes: Vec<usize> = (0..8)
                .map(|p| touch.homenode(&exchange, p * PAGE_SIZE))
                .collect();
            exchange.barrier();
            homes
        });

        let exchange = Exchange::attach(&layout, 0, true, Some(&path)).unwrap();
        let touch = FirstTouch::new(&layout, 0);
        let homes: Vec<usize> = (0..8)
            .map(|p| touch.homenode(&exchange, p * PAGE_SIZE))
            .collect();
        exchange.barrier();
        let peer_homes = peer.join().unwrap();

        // Both nodes resolved every page to the same single owner.
        assert_eq!(homes, peer_homes);
    }
}
