//! Run-end statistics counters.
//!
//! Counters are plain atomics so the fault handler and worker threads can
//! bump them without extra locking; timers accumulate whole microseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide counters, printed at finalize when requested.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Number of remote page loads.
    pub loads: AtomicU64,
    /// Number of diff write-backs of individual pages.
    pub stores: AtomicU64,
    /// Number of write buffer overflow evictions.
    pub writebacks: AtomicU64,
    /// Number of global barriers executed.
    pub barriers: AtomicU64,
    /// Number of global lock acquisitions.
    pub locks: AtomicU64,

    /// Time spent loading pages, in microseconds.
    pub load_time: AtomicU64,
    /// Time spent in write-upgrade faults, in microseconds.
    pub store_time: AtomicU64,
    /// Time spent flushing the write buffer, in microseconds.
    pub flush_time: AtomicU64,
    /// Time spent in overflow write-backs, in microseconds.
    pub writeback_time: AtomicU64,
    /// Time spent in the global barrier, in microseconds.
    pub barrier_time: AtomicU64,
    /// Time spent self-invalidating, in microseconds.
    pub selfinv_time: AtomicU64,
    /// Time spent in selective acquire, in microseconds.
    pub selective_acquire_time: AtomicU64,
    /// Time spent in selective release, in microseconds.
    pub selective_release_time: AtomicU64,
}

impl Statistics {
    /// Add the elapsed time since `start` to a timer.
    #[inline]
    pub fn add_elapsed(timer: &AtomicU64, start: Instant) {
        timer.fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    /// Increment a counter by one.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset every counter and timer to zero.
    pub fn clear(&self) {
        for counter in [
            &self.loads,
            &self.stores,
            &self.writebacks,
            &self.barriers,
            &self.locks,
            &self.load_time,
            &self.store_time,
            &self.flush_time,
            &self.writeback_time,
            &self.barrier_time,
            &self.selfinv_time,
            &self.selective_acquire_time,
            &self.selective_release_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Print the collected counters for one node.
    pub fn print(&self, node_id: usize, cache_pages: usize, write_buffer_size: usize) {
        let us = |t: &AtomicU64| t.load(Ordering::Relaxed) as f64 / 1e6;
        println!("##################### STATISTICS #########################");
        println!("# node {node_id}: cache pages {cache_pages}, write buffer {write_buffer_size}");
        println!(
            "# store time: {:.6}s, load time: {:.6}s, flush time: {:.6}s, writeback time: {:.6}s",
            us(&self.store_time),
            us(&self.load_time),
            us(&self.flush_time),
            us(&self.writeback_time),
        );
        println!(
            "# selective release time: {:.6}s, selective acquire time: {:.6}s",
            us(&self.selective_release_time),
            us(&self.selective_acquire_time),
        );
        println!(
            "# barrier time: {:.6}s, self-invalidation time: {:.6}s",
            us(&self.barrier_time),
            us(&self.selfinv_time),
        );
        println!(
            "# stores: {}, loads: {}, barriers: {}, writebacks: {}, locks: {}",
            self.stores.load(Ordering::Relaxed),
            self.loads.load(Ordering::Relaxed),
            self.barriers.load(Ordering::Relaxed),
            self.writebacks.load(Ordering::Relaxed),
            self.locks.load(Ordering::Relaxed),
        );
        println!("##########################################################");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_resets_counters() {
        let stats = Statistics::default();
        Statistics::bump(&stats.loads);
        Statistics::bump(&stats.barriers);
        stats.clear();
        assert_eq!(stats.loads.load(Ordering::Relaxed), 0);
        assert_eq!(stats.barriers.load(Ordering::Relaxed), 0);
    }
}
