//! Single-node end-to-end exercise.
//!
//! One process is a complete (if lonely) cluster: every page is locally
//! homed, so this drives the local fault paths, the arena, the atomics
//! and the lock stack without any peer. The runtime is process-global, so
//! everything lives in one test function.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vela::prelude::*;
use vela::sync::GlobalTasLock;

#[test]
fn single_node_walkthrough() {
    vela::init(16 << 20, 2 << 20).expect("init single node");
    assert_eq!(vela::node_id(), 0);
    assert_eq!(vela::number_of_nodes(), 1);

    // Fresh global memory reads as zero, and ordinary stores stick.
    let values = vela::alloc_array::<u64>(1024).unwrap();
    unsafe {
        assert_eq!(values.read(), 0);
        assert_eq!(values.add(1023).read(), 0);
        values.write(7);
        values.add(1023).write(9);
        assert_eq!(values.read(), 7);
        assert_eq!(values.add(1023).read(), 9);
    }

    // Distinct allocations never alias.
    let first = vela::alloc(100).unwrap();
    let second = vela::alloc(100).unwrap();
    assert_ne!(first.as_ptr(), second.as_ptr());
    let collective = vela::alloc_collective(64).unwrap();
    assert_ne!(collective.as_ptr(), second.as_ptr());

    // Pointer metadata: a single node homes everything.
    assert_eq!(values.homenode(), 0);
    assert!(values.offset() < vela::global_size());

    // Barrier, acquire and release are safe no-ops in effect.
    vela::barrier(1);
    vela::acquire();
    vela::release();

    // Writes survive a full synchronization cycle.
    unsafe { assert_eq!(values.read(), 7) };

    // Atomics on global words.
    let counter = vela::alloc_array::<u64>(1).unwrap();
    assert_eq!(atomics::fetch_add(counter, 5u64, MemoryOrder::Relaxed).unwrap(), 0);
    assert_eq!(atomics::load(counter, MemoryOrder::Relaxed).unwrap(), 5);
    assert_eq!(
        atomics::exchange(counter, 11u64, MemoryOrder::Relaxed).unwrap(),
        5
    );
    assert_eq!(
        atomics::compare_exchange(counter, 11u64, 13, MemoryOrder::Relaxed).unwrap(),
        11
    );
    assert_eq!(
        atomics::compare_exchange(counter, 999u64, 0, MemoryOrder::Relaxed).unwrap(),
        13,
        "failed compare-exchange reports the found value"
    );
    atomics::store(counter, 2u64, MemoryOrder::Relaxed).unwrap();
    assert_eq!(atomics::load(counter, MemoryOrder::AcqRel).unwrap(), 2);

    // A misaligned word is an invalid argument, not a crash.
    let bytes = vela::alloc_array::<u8>(64).unwrap();
    let misaligned = bytes.add(1).cast::<u32>();
    assert!(atomics::load(misaligned, MemoryOrder::Relaxed).is_err());

    // Wrapping fetch-add.
    let wrap = vela::alloc_array::<u32>(1).unwrap();
    atomics::store(wrap, u32::MAX, MemoryOrder::Relaxed).unwrap();
    assert_eq!(
        atomics::fetch_add(wrap, 1u32, MemoryOrder::Relaxed).unwrap(),
        u32::MAX
    );
    assert_eq!(atomics::load(wrap, MemoryOrder::Relaxed).unwrap(), 0);

    // Selective operations over a range are harmless when nothing remote
    // is cached.
    unsafe {
        vela::selective_release(values.as_ptr().cast(), 4096);
        vela::selective_acquire(values.as_ptr().cast(), 4096);
        assert_eq!(values.read(), 7);
    }

    // Global test-and-set lock: trylock semantics and re-entry by the
    // same node.
    let lock = GlobalTasLock::new(5);
    assert!(lock.try_lock());
    assert!(!lock.try_lock());
    lock.unlock();
    assert!(lock.try_lock());
    lock.unlock();

    // Cohort lock: mutual exclusion over non-atomic global increments.
    let cohort = Arc::new(CohortLock::new(6));
    let shared = vela::alloc_array::<u64>(1).unwrap();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cohort = Arc::clone(&cohort);
            std::thread::spawn(move || {
                for _ in 0..250 {
                    cohort.lock();
                    unsafe { shared.write(shared.read() + 1) };
                    cohort.unlock();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    unsafe { assert_eq!(shared.read(), 1000) };

    // Thread-spanning barrier: leaders rotate invisibly, everyone syncs.
    let rounds = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let rounds = Arc::clone(&rounds);
            std::thread::spawn(move || {
                for round in 0..50u64 {
                    vela::barrier(4);
                    assert!(rounds.load(Ordering::SeqCst) >= round);
                    rounds.fetch_add(1, Ordering::SeqCst);
                    vela::barrier(4);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(rounds.load(Ordering::SeqCst), 200);

    vela::finalize();
}
