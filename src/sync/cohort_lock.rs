//! Cohort lock: hierarchical locking with local hand-over preference.
//!
//! Three levels compose: an MCS lock per NUMA domain, a ticket lock across
//! the domains of one node, and the global test-and-set lock across nodes.
//! As long as local contention exists the lock is handed over at the
//! finest level, bounded by the hand-over counters; once a bound is
//! exceeded the lock is released one level up so other domains and nodes
//! make progress.
//!
//! Do not place this lock in global memory: it carries node-local state.
//! Construct it with the same lock window slot on every node.

use super::numa::Topology;
use super::{GlobalTasLock, McsLock, TicketLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Hand-overs within one NUMA domain before escalating.
const MAX_HANDOVER: u32 = 8192;
/// Hand-overs between NUMA domains before releasing the global lock.
const MAX_HANDOVER_NODELOCK: u32 = 128;
/// Sentinel for "no domain holds the node lock".
const NO_OWNER: usize = usize::MAX;

pub struct CohortLock {
    topology: Topology,
    /// One MCS lock per NUMA domain.
    domain_locks: Vec<McsLock>,
    /// Ticket lock across the domains of this node.
    node_lock: TicketLock,
    /// The cross-node level.
    global_lock: GlobalTasLock,
    /// Whether this node currently holds the global lock.
    has_global_lock: AtomicBool,
    /// Domain currently holding the node lock, or `NO_OWNER`.
    node_lock_owner: AtomicUsize,
    /// Domain of the current holder, read back at unlock.
    holder_domain: AtomicUsize,
    /// Hand-over counters per domain.
    handovers: Vec<AtomicUsize>,
    /// Hand-overs between domains since the global lock was taken.
    numa_handovers: AtomicUsize,
}

impl CohortLock {
    /// Create the cohort lock over lock window slot `slot`. Every node
    /// must use the same slot.
    pub fn new(slot: usize) -> Self {
        let topology = Topology::discover();
        let domains = topology.domains();
        CohortLock {
            topology,
            domain_locks: (0..domains).map(|_| McsLock::new()).collect(),
            node_lock: TicketLock::new(),
            global_lock: GlobalTasLock::new(slot),
            has_global_lock: AtomicBool::new(false),
            node_lock_owner: AtomicUsize::new(NO_OWNER),
            holder_domain: AtomicUsize::new(0),
            handovers: (0..domains).map(|_| AtomicUsize::new(0)).collect(),
            numa_handovers: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) {
        let domain = self.topology.current_domain();
        self.domain_locks[domain].lock();
        self.holder_domain.store(domain, Ordering::Relaxed);

        if self.node_lock_owner.load(Ordering::Acquire) != domain {
            self.node_lock.lock();
            self.node_lock_owner.store(domain, Ordering::Release);
            if !self.has_global_lock.load(Ordering::Acquire) {
                self.global_lock.lock();
                self.has_global_lock.store(true, Ordering::Release);
            }
        }
    }

    /// Release the lock, preferring the most local hand-over available.
    pub fn unlock(&self) {
        let domain = self.holder_domain.load(Ordering::Relaxed);

        if self.domain_locks[domain].is_contended()
            && self.handovers[domain].load(Ordering::Relaxed) < MAX_HANDOVER as usize
        {
            // Hand over within the domain; the node and global levels stay
            // held by this node.
            self.handovers[domain].fetch_add(1, Ordering::Relaxed);
        } else {
            self.handovers[domain].store(0, Ordering::Relaxed);
            self.node_lock_owner.store(NO_OWNER, Ordering::Release);

            if self.node_lock.is_contended()
                && self.numa_handovers.load(Ordering::Relaxed) < MAX_HANDOVER_NODELOCK as usize
            {
                // Hand over to another domain of this node.
                self.numa_handovers.fetch_add(1, Ordering::Relaxed);
            } else {
                // Hand over to another node.
                self.numa_handovers.store(0, Ordering::Relaxed);
                self.has_global_lock.store(false, Ordering::Release);
                self.global_lock.unlock();
            }
            self.node_lock.unlock();
        }
        self.domain_locks[domain].unlock();
    }
}
