//! Global arena: the shared bump allocator over the global address space.
//!
//! One cursor, shared by every node, protected by the global test-and-set
//! lock in its reserved slot. Allocations are rounded up to whole
//! coherence units, so no two allocations share a unit and false sharing
//! between them is impossible at protocol granularity. The backing pages
//! are zero-filled at creation; a fresh allocation therefore reads as
//! zeroes on every node without any touch.
//!
//! There is no deallocation: the arena only ever grows, and teardown
//! happens with the run. Higher-level allocators sit above this one.

use crate::distribution::GlobalPtr;
use crate::error::{Error, Result};
use crate::layout::align_forwards;
use crate::runtime::runtime;
use crate::sync::GlobalTasLock;
use std::sync::atomic::Ordering;

/// Lock window slot reserved for the arena.
pub(crate) const ARENA_LOCK_SLOT: usize = 0;

/// Allocate `len` bytes of global memory.
///
/// Callable from any node at any time; distinct callers receive distinct
/// memory. Fails when the global address space is exhausted.
pub fn alloc(len: usize) -> Result<GlobalPtr<u8>> {
    let rt = runtime();
    let offset = bump(len)?;
    let raw = (rt.vm.start() as usize + offset) as *mut u8;
    Ok(GlobalPtr::new(raw).expect("arena cursor inside the global range"))
}

/// Allocate a zeroed array of `count` elements of `T` in global memory.
pub fn alloc_array<T>(count: usize) -> Result<GlobalPtr<T>> {
    let len = count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(|| Error::InvalidArgument("allocation size overflows".into()))?;
    alloc(len).map(GlobalPtr::cast)
}

/// Collective allocation: every node calls with the same `len` and every
/// node receives the same pointer.
///
/// Node 0 performs the bump and broadcasts the offset; the trailing
/// barrier in the broadcast keeps the nodes' views aligned, so the next
/// collective call pairs up again.
pub fn alloc_collective(len: usize) -> Result<GlobalPtr<u8>> {
    let rt = runtime();
    let mut payload = [0u8; 8];
    if rt.node_id == 0 {
        let offset = bump(len)?;
        payload = (offset as u64).to_le_bytes();
    }
    {
        let serial = rt.exchange.serialize();
        rt.exchange.broadcast(&serial, 0, &mut payload);
    }
    let offset = u64::from_le_bytes(payload) as usize;
    let raw = (rt.vm.start() as usize + offset) as *mut u8;
    Ok(GlobalPtr::new(raw).expect("arena cursor inside the global range"))
}

/// Collective typed allocation; see [`alloc_collective`].
pub fn alloc_collective_array<T>(count: usize) -> Result<GlobalPtr<T>> {
    let len = count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(|| Error::InvalidArgument("allocation size overflows".into()))?;
    alloc_collective(len).map(GlobalPtr::cast)
}

/// Bytes already handed out.
pub fn used() -> usize {
    let rt = runtime();
    rt.exchange.arena_cursor().load(Ordering::SeqCst) as usize
}

/// Advance the cursor by `len` rounded up to coherence units.
fn bump(len: usize) -> Result<usize> {
    let rt = runtime();
    let alignment = rt.layout.block_size;
    let rounded = align_forwards(len.max(1), alignment);

    let lock = GlobalTasLock::new(ARENA_LOCK_SLOT);
    lock.lock();
    let cursor = rt.exchange.arena_cursor();
    let offset = cursor.load(Ordering::SeqCst) as usize;
    let result = if offset + rounded > rt.layout.total_size {
        Err(Error::Exhausted(format!(
            "global arena exhausted: {offset:#x} of {:#x} used, {rounded:#x} requested",
            rt.layout.total_size
        )))
    } else {
        cursor.store((offset + rounded) as u64, Ordering::SeqCst);
        Ok(offset)
    };
    lock.unlock();
    result
}
