//! Global test-and-set lock.
//!
//! A lock is a single word in the lock window, holding either the
//! distinguished `LOCKED` value, the never-owned `LOCK_INIT` sentinel, or
//! the id of the last node to release it. Releasing by writing one's own
//! node id lets the same node re-enter with a purely local acquire: only
//! when the previous holder was a different node must the full acquire
//! (self-invalidation) run.

use crate::runtime::runtime;
use crate::stats::Statistics;
use crate::transport::{LOCK_INIT, LOCK_SLOTS};
use std::sync::atomic::{fence, Ordering};

/// Word value while some node holds the lock.
const LOCKED: u64 = u64::MAX - 1;

/// A test-and-set lock spanning all nodes.
///
/// Constructed from a lock window slot; every node must name the same slot
/// for the same logical lock. Slot 0 is reserved for the runtime's global
/// arena.
pub struct GlobalTasLock {
    slot: usize,
}

impl GlobalTasLock {
    /// Bind a lock to lock window slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is out of range.
    pub fn new(slot: usize) -> Self {
        assert!(slot < LOCK_SLOTS, "lock slot {slot} out of range");
        GlobalTasLock { slot }
    }

    /// Try to take the lock without blocking.
    ///
    /// On success the caller's view of memory is coherent with everything
    /// the previous holder released.
    pub fn try_lock(&self) -> bool {
        let rt = runtime();
        let word = rt.exchange.lock_word(self.slot);
        let previous = {
            let _serial = rt.exchange.serialize();
            word.swap(LOCKED, Ordering::SeqCst)
        };
        if previous == LOCKED {
            return false;
        }
        Statistics::bump(&rt.stats.locks);
        if previous == LOCK_INIT || previous == rt.node_id as u64 {
            // The lock was never held, or we held it last: nothing remote
            // to make visible, a local fence suffices.
            fence(Ordering::Acquire);
        } else {
            crate::acquire();
        }
        true
    }

    /// Take the lock, spinning until it is available.
    pub fn lock(&self) {
        while !self.try_lock() {
            std::thread::yield_now();
        }
    }

    /// Release the lock.
    ///
    /// Unlocking a lock this node does not hold is not detected.
    pub fn unlock(&self) {
        let rt = runtime();
        crate::release();
        let word = rt.exchange.lock_word(self.slot);
        let _serial = rt.exchange.serialize();
        word.store(rt.node_id as u64, Ordering::SeqCst);
    }
}
