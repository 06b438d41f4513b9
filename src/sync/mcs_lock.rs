//! Node-local MCS queue lock.
//!
//! Each waiting thread spins on its own queue node, so handing the lock
//! over touches only the successor's cache line. The queue node for each
//! (thread, lock) pair lives in thread-local storage; a lock must be
//! released by the thread that acquired it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

struct McsNode {
    next: AtomicPtr<McsNode>,
    locked: AtomicBool,
}

thread_local! {
    /// This thread's queue nodes, one per lock it has ever taken.
    static NODES: RefCell<HashMap<usize, Box<McsNode>>> = RefCell::new(HashMap::new());
}

pub(crate) struct McsLock {
    tail: AtomicPtr<McsNode>,
}

impl McsLock {
    pub fn new() -> Self {
        McsLock {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// This thread's queue node for this lock. The box gives the node a
    /// stable address for the lifetime of the thread.
    fn self_node(&self) -> *mut McsNode {
        let key = self as *const _ as usize;
        NODES.with(|nodes| {
            let mut nodes = nodes.borrow_mut();
            let node = nodes.entry(key).or_insert_with(|| {
                Box::new(McsNode {
                    next: AtomicPtr::new(ptr::null_mut()),
                    locked: AtomicBool::new(false),
                })
            });
            &mut **node as *mut McsNode
        })
    }

    pub fn lock(&self) {
        let node = self.self_node();
        // SAFETY: node is this thread's own; no one links to it until the
        // swap below publishes it.
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*node).locked.store(true, Ordering::Relaxed);
        }
        let predecessor = self.tail.swap(node, Ordering::AcqRel);
        if !predecessor.is_null() {
            // SAFETY: a predecessor stays valid until it hands over.
            unsafe { (*predecessor).next.store(node, Ordering::Release) };
            // SAFETY: spinning on our own node.
            while unsafe { (*node).locked.load(Ordering::Acquire) } {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        let node = self.self_node();
        // SAFETY: as in lock().
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*node).locked.store(true, Ordering::Relaxed);
        }
        self.tail
            .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        let node = self.self_node();
        // SAFETY: we hold the lock, so our node is the queue head.
        let successor = unsafe { (*node).next.load(Ordering::Acquire) };
        if successor.is_null() {
            if self
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // A new waiter is linking itself in; wait for the pointer.
            loop {
                // SAFETY: as above.
                let successor = unsafe { (*node).next.load(Ordering::Acquire) };
                if !successor.is_null() {
                    // SAFETY: the successor spins until this store.
                    unsafe { (*successor).locked.store(false, Ordering::Release) };
                    return;
                }
                std::hint::spin_loop();
            }
        }
        // SAFETY: as above.
        unsafe { (*successor).locked.store(false, Ordering::Release) };
    }

    /// Whether any thread currently holds or waits for the lock.
    pub fn is_contended(&self) -> bool {
        !self.tail.load(Ordering::Relaxed).is_null()
    }
}

// SAFETY: the queue links only ever point at nodes owned by live threads
// blocked inside lock(), and all cross-thread accesses are atomic.
unsafe impl Send for McsLock {}
unsafe impl Sync for McsLock {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(McsLock::new());
        let shared = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        lock.lock();
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
    fn test_try_lock_fails_while_held() {
        let lock = Arc::new(McsLock::new());
        lock.lock();
        let lock2 = Arc::clone(&lock);
        let other = std::thread::spawn(move || lock2.try_lock());
        assert!(!other.join().unwrap());
        lock.unlock();
    }

    #[test]
    fn test_reacquire_by_same_thread() {
        let lock = McsLock::new();
        for _ in 0..100 {
            lock.lock();
            assert!(lock.is_contended());
            lock.unlock();
        }
        assert!(!lock.is_contended());
    }
}
