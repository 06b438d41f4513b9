//! Node-local ticket lock.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A fair spin lock handing out tickets in arrival order.
pub(crate) struct TicketLock {
    /// Threads that have requested the lock.
    in_counter: AtomicUsize,
    /// Threads that have released the lock.
    out_counter: AtomicUsize,
}

impl TicketLock {
    pub fn new() -> Self {
        TicketLock {
            in_counter: AtomicUsize::new(0),
            out_counter: AtomicUsize::new(0),
        }
    }

    /// Take a ticket and wait until it is served.
    pub fn lock(&self) {
        let ticket = self.in_counter.fetch_add(1, Ordering::Relaxed);
        while self.out_counter.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.out_counter.fetch_add(1, Ordering::Release);
    }

    /// Whether some thread is waiting behind the current holder.
    pub fn is_contended(&self) -> bool {
        let waiting = self.in_counter.load(Ordering::Relaxed);
        let served = self.out_counter.load(Ordering::Relaxed);
        waiting.wrapping_sub(served) > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutual_exclusion_and_fairness() {
        let lock = Arc::new(TicketLock::new());
        let shared = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        lock.lock();
                        // Non-atomic read-modify-write under the lock.
                        let value = shared.load(Ordering::Relaxed);
                        shared.store(value + 1, Ordering::Relaxed);
                        lock.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_uncontended_is_not_contended() {
        let lock = TicketLock::new();
        lock.lock();
        assert!(!lock.is_contended());
        lock.unlock();
    }
}
