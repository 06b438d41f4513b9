//! Reusable thread barrier with a generation counter.
//!
//! A thread slow to leave one barrier episode cannot corrupt the next:
//! arrivals count against the current generation, and waiters sleep until
//! the generation moves on. Exactly one waiter per episode is told it is
//! the leader.

use parking_lot::{Condvar, Mutex};

struct State {
    /// Threads arrived in the current generation.
    count: usize,
    /// Completed barrier episodes.
    generation: u64,
}

pub(crate) struct ThreadBarrier {
    participants: usize,
    state: Mutex<State>,
    condvar: Condvar,
}

impl ThreadBarrier {
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "a barrier needs at least one participant");
        ThreadBarrier {
            participants,
            state: Mutex::new(State {
                count: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Wait for all participants. Returns true for exactly one thread per
    /// episode (the last arriver).
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.count += 1;
        if state.count == self.participants {
            state.count = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
            true
        } else {
            let arrived_in = state.generation;
            while state.generation == arrived_in {
                self.condvar.wait(&mut state);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_single_participant_is_always_leader() {
        let barrier = ThreadBarrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
    }

    #[test]
    fn test_exactly_one_leader_per_episode() {
        let barrier = Arc::new(ThreadBarrier::new(4));
        let leaders = Arc::new(AtomicUsize::new(0));
        let episodes = 100;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                std::thread::spawn(move || {
                    for _ in 0..episodes {
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::Relaxed), episodes);
    }

    #[test]
    fn test_rapid_reuse_does_not_deadlock() {
        let barrier = Arc::new(ThreadBarrier::new(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let other = {
            let barrier = Arc::clone(&barrier);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    barrier.wait();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        for _ in 0..1000 {
            barrier.wait();
            counter.fetch_add(1, Ordering::Relaxed);
        }
        other.join().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }
}
