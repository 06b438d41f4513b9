//! The coherence engine.
//!
//! Implements the fault-driven single-writer / multiple-reader protocol:
//! the fault handler entry, remote loads with eviction, write upgrades
//! with twin snapshots, diff-based write-back, self-invalidation and the
//! selective acquire/release operations.
//!
//! Locking discipline: the cache mutex is taken first, the transport
//! serialization point second. Directory words are only ever mutated
//! through one-sided atomics; remote page contents only move under an open
//! data-window session.

use crate::cache::{Dirtiness, LineState, PageCache};
use crate::directory::single_node_of;
use crate::layout::{align_backwards, CACHELINE, PAGE_SIZE};
use crate::runtime::Runtime;
use crate::stats::Statistics;
use crate::transport::SerializerGuard;
use crate::vm::Protection;
use std::time::Instant;

/// Entry point from the signal dispatcher: service a fault at `fault_addr`
/// (an address inside the global range).
pub(crate) fn handle_fault(rt: &Runtime, fault_addr: usize) {
    let started = Instant::now();
    let layout = &rt.layout;
    let start = rt.vm.start() as usize;

    let access_offset = fault_addr - start;
    let aligned = align_backwards(access_offset, layout.block_size);
    let classidx = layout.classification_index(aligned);
    let me = rt.node_id;

    // The home is resolved before any lock is taken: under first-touch
    // this may claim ownership, which synchronizes on its own directory
    // mutex and must not nest inside the cache mutex.
    let home = rt.dist.homenode(&rt.exchange, aligned);

    if home == me {
        let local_offset = rt.dist.local_offset(&rt.exchange, aligned);
        let _cache = rt.cache.lock();
        let serial = rt.exchange.serialize();
        local_fault(rt, &serial, aligned, classidx, local_offset);
        return;
    }

    let mut cache = rt.cache.lock();
    let start_index = layout.cache_index(aligned);
    let line = (start_index / CACHELINE) * CACHELINE;
    let state = cache.lines[line].state;
    let tag = cache.lines[line].tag;

    if state == LineState::Invalid || (tag != aligned && tag != layout.tag_none) {
        let offset = rt.dist.local_offset(&rt.exchange, aligned);
        let serial = rt.exchange.serialize();
        fill_cache_line(rt, &mut cache, &serial, aligned, line, home, offset);

        // Speculatively pull the next unit while the transport is hot.
        // Skipped under first-touch: resolving the neighbour's home would
        // claim ownership of a page nobody has actually touched.
        if !rt.dist.is_first_touch() {
            let next_tag = aligned + layout.block_size;
            if next_tag < layout.total_size {
                let next_home = rt.dist.homenode(&rt.exchange, next_tag);
                if next_home != me {
                    let next_offset = rt.dist.local_offset(&rt.exchange, next_tag);
                    let next_line = (line + CACHELINE) % layout.cache_pages;
                    fill_cache_line(
                        rt, &mut cache, &serial, next_tag, next_line, next_home, next_offset,
                    );
                }
            }
        }
        drop(serial);
        drop(cache);
        Statistics::add_elapsed(&rt.stats.load_time, started);
        return;
    }

    // Write after read: another thread may have upgraded already.
    if cache.lines[line].dirty == Dirtiness::Dirty {
        return;
    }

    let serial = rt.exchange.serialize();
    write_upgrade(rt, &mut cache, &serial, aligned, line, classidx, home);
    drop(serial);
    drop(cache);
    Statistics::add_elapsed(&rt.stats.store_time, started);
}

/// Cases A.1 and A.2: the faulting unit is homed on this node. The page is
/// mapped straight onto our share of the exchange segment; no cache line
/// and no write buffer entry are involved.
fn local_fault(
    rt: &Runtime,
    serial: &SerializerGuard<'_>,
    aligned: usize,
    classidx: usize,
    local_offset: usize,
) {
    let layout = &rt.layout;
    let me = rt.node_id;
    let me_bit = rt.dir.self_bit();
    let gas_ptr = (rt.vm.start() as usize + aligned) as *mut u8;
    let backing_offset = rt.exchange.data_segment_offset(me) + local_offset;

    let sharers = rt.dir.local_sharers(serial, &rt.exchange, classidx);
    if sharers & me_bit != me_bit {
        // A.1: first local access since invalidation.
        let old = rt.dir.local_or_sharers(serial, &rt.exchange, classidx, me_bit);
        if old != me_bit {
            if let Some(owner) = single_node_of(old) {
                assert_ne!(owner, me, "own node listed as remote private holder");
                // Demote the private holder: once it sees a foreign writer
                // bit its next release downgrades the copy.
                rt.dir
                    .writers_accumulate(serial, &rt.exchange, owner, classidx, me_bit);
            }
        }
        // SAFETY: aligned unit inside the global range, under cache mutex.
        unsafe {
            rt.vm.map_memory(
                gas_ptr,
                layout.block_size,
                rt.exchange.fd(),
                backing_offset,
                Protection::Read,
            );
        }
    } else {
        // A.2: write after read.
        let writers = rt.dir.local_writers(serial, &rt.exchange, classidx);
        rt.dir.local_or_writers(serial, &rt.exchange, classidx, me_bit);

        if let Some(owner) = (writers != me_bit && writers != 0)
            .then(|| single_node_of(writers & !me_bit))
            .flatten()
        {
            rt.dir
                .writers_accumulate(serial, &rt.exchange, owner, classidx, me_bit);
        } else if writers == me_bit || writers == 0 {
            for node in 0..layout.nodes {
                if node != me && sharers & (1u64 << node) != 0 {
                    rt.dir
                        .writers_accumulate(serial, &rt.exchange, node, classidx, me_bit);
                }
            }
        }
        // SAFETY: as above.
        unsafe {
            rt.vm.map_memory(
                gas_ptr,
                layout.block_size,
                rt.exchange.fd(),
                backing_offset,
                Protection::ReadWrite,
            );
        }
    }
}

/// Cases B.1 and B.2: evict the conflicting resident unit if any, then
/// load `tag` from its home into cache slot `line` and map it read-only.
/// Also used for the speculative second load.
fn fill_cache_line(
    rt: &Runtime,
    cache: &mut PageCache,
    serial: &SerializerGuard<'_>,
    tag: usize,
    line: usize,
    home: usize,
    offset: usize,
) {
    let layout = &rt.layout;
    let start = rt.vm.start() as usize;
    let me_bit = rt.dir.self_bit();

    if tag >= layout.total_size {
        return;
    }

    // Another thread may have loaded this unit while we waited.
    if cache.lines[line].tag == tag && cache.lines[line].state != LineState::Invalid {
        return;
    }

    // B.1: eviction of a conflicting resident unit.
    let old_tag = cache.lines[line].tag;
    if old_tag != tag && old_tag != layout.tag_none {
        let old_ptr = (start + old_tag) as *mut u8;
        if cache.lines[line].dirty == Dirtiness::Dirty {
            tracing::debug!(line, old_tag, new_tag = tag, "evicting dirty line");
            // SAFETY: resident unit, under cache mutex.
            unsafe { rt.vm.protect(old_ptr, layout.block_size, Protection::Read) };
            for page in 0..CACHELINE {
                store_page_diff(rt, cache, serial, line + page, old_tag + page * PAGE_SIZE);
            }
            rt.write_buffer.erase(line);
        }
        cache.windows.close_all();

        cache.lines[line].state = LineState::Invalid;
        cache.lines[line].tag = tag;
        cache.lines[line].dirty = Dirtiness::Clean;
        // SAFETY: both addresses are aligned units in the global range.
        unsafe {
            rt.vm.map_memory(
                (start + tag) as *mut u8,
                layout.block_size,
                rt.vm.cache_fd(),
                line * PAGE_SIZE,
                Protection::None,
            );
            rt.vm.protect(old_ptr, layout.block_size, Protection::None);
        }
    }

    Statistics::bump(&rt.stats.loads);
    let classidx = layout.classification_index(tag);

    // B.2: register as a sharer on the home, once.
    let prev_sharer = rt.dir.local_sharers(serial, &rt.exchange, classidx) & me_bit;
    if prev_sharer == 0 {
        let (old_sharers, home_writers) =
            rt.dir
                .sharers_fetch_or(serial, &rt.exchange, home, classidx, me_bit);
        rt.dir
            .local_or_sharers(serial, &rt.exchange, classidx, old_sharers);
        rt.dir
            .local_or_writers(serial, &rt.exchange, classidx, home_writers);

        // A single other node held the unit privately; OR ourselves into
        // its sharer view so it stops assuming exclusivity.
        if let Some(owner) = single_node_of(old_sharers & !me_bit) {
            rt.dir
                .sharers_accumulate(serial, &rt.exchange, owner, classidx, me_bit);
        }
    }

    // Fetch the unit contents into the cache slot.
    // SAFETY: the slot is ours under the cache mutex, and the linear cache
    // view is writable for a whole unit.
    unsafe {
        rt.exchange
            .get(serial, home, offset, cache.data_ptr(line), layout.block_size);
    }

    let gas_ptr = (start + tag) as *mut u8;
    if cache.lines[line].tag == layout.tag_none {
        // First use of this slot: establish the alias mapping.
        // SAFETY: aligned unit in the global range.
        unsafe {
            rt.vm.map_memory(
                gas_ptr,
                layout.block_size,
                rt.vm.cache_fd(),
                line * PAGE_SIZE,
                Protection::Read,
            );
        }
        cache.lines[line].tag = tag;
    } else {
        // SAFETY: as above; the alias mapping already exists.
        unsafe { rt.vm.protect(gas_ptr, layout.block_size, Protection::Read) };
    }
    cache.touched[line] = true;
    cache.lines[line].state = LineState::Valid;
    cache.lines[line].dirty = Dirtiness::Clean;
}

/// Case B.3: transition a resident read-only unit to writable. Snapshots
/// the twin, registers this node as a writer and notifies the nodes that
/// must downgrade at their next release.
fn write_upgrade(
    rt: &Runtime,
    cache: &mut PageCache,
    serial: &SerializerGuard<'_>,
    tag: usize,
    line: usize,
    classidx: usize,
    home: usize,
) {
    let layout = &rt.layout;
    let me = rt.node_id;
    let me_bit = rt.dir.self_bit();
    let gas_ptr = (rt.vm.start() as usize + tag) as *mut u8;

    cache.touched[line] = true;
    cache.lines[line].dirty = Dirtiness::Dirty;

    let writers = rt.dir.local_writers(serial, &rt.exchange, classidx);
    // Not yet registered, and at most one writer known: the directory on
    // the home may have to be told.
    if writers != me_bit && (writers == 0 || writers.is_power_of_two()) {
        rt.dir.local_or_writers(serial, &rt.exchange, classidx, me_bit);

        let old_writers = rt
            .dir
            .writers_fetch_or(serial, &rt.exchange, home, classidx, me_bit);
        let home_sharers = rt.dir.sharers_load(serial, &rt.exchange, home, classidx);
        let writers_now = old_writers | me_bit;
        rt.dir
            .local_or_sharers(serial, &rt.exchange, classidx, home_sharers);

        if let Some(owner) = single_node_of(writers_now & !me_bit) {
            // A unique remote writer: downgrade just that one.
            rt.dir
                .writers_accumulate(serial, &rt.exchange, owner, classidx, me_bit);
        } else if writers_now == me_bit || writers_now == 0 {
            // We are the only writer: every remote sharer must learn of us.
            for node in 0..layout.nodes {
                if node != me && home_sharers & (1u64 << node) != 0 {
                    rt.dir
                        .writers_accumulate(serial, &rt.exchange, node, classidx, me_bit);
                }
            }
        }
    }

    // Twin snapshot before the first post-upgrade store can land.
    // SAFETY: the unit is resident and readable.
    unsafe { cache.snapshot_twin(line, gas_ptr as *const u8) };

    if let Some(batch) = rt.write_buffer.add(line) {
        let write_back_started = Instant::now();
        rt.stats
            .writebacks
            .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
        write_back_lines(rt, cache, serial, &batch);
        cache.windows.close_all();
        Statistics::add_elapsed(&rt.stats.writeback_time, write_back_started);
    }

    // SAFETY: aligned resident unit.
    unsafe { rt.vm.protect(gas_ptr, layout.block_size, Protection::ReadWrite) };
}

/// Write back a batch of cache lines: downgrade to read-only, mark clean
/// and push the byte diffs to the homes. Window sessions stay open for the
/// whole batch; the caller closes them.
fn write_back_lines(
    rt: &Runtime,
    cache: &mut PageCache,
    serial: &SerializerGuard<'_>,
    batch: &[usize],
) {
    let layout = &rt.layout;
    let start = rt.vm.start() as usize;
    for &index in batch {
        let addr = cache.lines[index].tag;
        debug_assert_ne!(addr, layout.tag_none);
        // SAFETY: resident dirty unit, under cache mutex.
        unsafe { rt.vm.protect((start + addr) as *mut u8, layout.block_size, Protection::Read) };
        cache.lines[index].dirty = Dirtiness::Clean;
        for page in 0..CACHELINE {
            store_page_diff(rt, cache, serial, index + page, addr + page * PAGE_SIZE);
        }
    }
}

/// Flush the whole write buffer and close the data windows.
pub(crate) fn flush_write_buffer(
    rt: &Runtime,
    cache: &mut PageCache,
    serial: &SerializerGuard<'_>,
) {
    let started = Instant::now();
    let batch = rt.write_buffer.take_all();
    if !batch.is_empty() {
        tracing::trace!(lines = batch.len(), "flushing write buffer");
    }
    write_back_lines(rt, cache, serial, &batch);
    cache.windows.close_all();
    Statistics::add_elapsed(&rt.stats.flush_time, started);
}

/// Propagate one dirty page to its home as byte diffs against the twin.
///
/// Requires the page to be mapped readable and an exclusive right to its
/// cache slot (cache mutex). The window session towards the home is opened
/// lazily and left open for the caller's batch.
pub(crate) fn store_page_diff(
    rt: &Runtime,
    cache: &mut PageCache,
    serial: &SerializerGuard<'_>,
    index: usize,
    addr: usize,
) {
    let home = rt.dist.homenode(&rt.exchange, addr);
    let offset = rt.dist.local_offset(&rt.exchange, addr);
    let real = (rt.vm.start() as usize + addr) as *const u8;

    if cache.windows.ensure_open(home) {
        tracing::trace!(home, "opening data window session");
    }

    // SAFETY: the page is resident and readable for PAGE_SIZE bytes.
    let current = unsafe { std::slice::from_raw_parts(real, PAGE_SIZE) };
    let twin = cache.twin(index);
    for (run_start, run_len) in diff_runs(current, twin) {
        // SAFETY: the run lies inside the resident page; the destination
        // range is inside the home's share by the distribution invariant.
        unsafe {
            rt.exchange.put(
                serial,
                home,
                offset + run_start,
                real.add(run_start),
                run_len,
            );
        }
    }
    Statistics::bump(&rt.stats.stores);
}

/// Coalesce the byte positions where `current` and `twin` differ into
/// `(start, len)` runs.
pub(crate) fn diff_runs(current: &[u8], twin: &[u8]) -> Vec<(usize, usize)> {
    debug_assert_eq!(current.len(), twin.len());
    let mut runs = Vec::new();
    let mut run_start = None;
    for (position, (a, b)) in current.iter().zip(twin.iter()).enumerate() {
        if a != b {
            run_start.get_or_insert(position);
        } else if let Some(start) = run_start.take() {
            runs.push((start, position - start));
        }
    }
    if let Some(start) = run_start {
        runs.push((start, current.len() - start));
    }
    runs
}

/// The acquire side: invalidate every touched line that another node may
/// have written since the last synchronization. Flushes the write buffer
/// first if any dirty line is encountered.
pub(crate) fn self_invalidation(
    rt: &Runtime,
    cache: &mut PageCache,
    serial: &SerializerGuard<'_>,
) {
    let started = Instant::now();
    let layout = &rt.layout;
    let start = rt.vm.start() as usize;
    let me_bit = rt.dir.self_bit();
    let mut flushed = false;

    for line in (0..layout.cache_pages).step_by(CACHELINE) {
        if !cache.touched[line] {
            continue;
        }
        let tag = cache.lines[line].tag;
        let classidx = layout.classification_index(tag);

        if !flushed && cache.lines[line].dirty == Dirtiness::Dirty {
            flush_write_buffer(rt, cache, serial);
            flushed = true;
        }

        let sharers = rt.dir.local_sharers(serial, &rt.exchange, classidx);
        let writers = rt.dir.local_writers(serial, &rt.exchange, classidx);
        let keep = writers == me_bit || (writers == 0 && sharers & me_bit == me_bit);
        if keep {
            cache.touched[line] = true;
        } else {
            cache.lines[line].dirty = Dirtiness::Clean;
            cache.lines[line].state = LineState::Invalid;
            cache.touched[line] = false;
            // SAFETY: the line's alias mapping exists (it was loaded).
            unsafe {
                rt.vm
                    .protect((start + tag) as *mut u8, layout.block_size, Protection::None)
            };
        }
    }
    Statistics::add_elapsed(&rt.stats.selfinv_time, started);
}

/// Selective acquire: the invalidation loop restricted to the units
/// overlapping `[addr, addr + len)`.
pub(crate) fn selective_acquire(rt: &Runtime, addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let started = Instant::now();
    let layout = &rt.layout;
    let start = rt.vm.start() as usize;
    let me_bit = rt.dir.self_bit();
    assert!(rt.vm.contains(addr as usize), "selective acquire outside the global range");

    let gas_offset = addr as usize - start;
    let misalignment = gas_offset % layout.block_size;
    let first = align_backwards(gas_offset, layout.block_size);

    let mut cache = rt.cache.lock();
    let serial = rt.exchange.serialize();

    let mut page = first;
    while page < first + misalignment + len {
        let index = layout.cache_index(page);
        // Only a slot that actually holds this unit is the range's concern.
        if cache.lines[index].tag == page {
            if cache.lines[index].dirty == Dirtiness::Dirty {
                // SAFETY: resident dirty unit, under cache mutex.
                unsafe {
                    rt.vm
                        .protect((start + page) as *mut u8, layout.block_size, Protection::Read)
                };
                for offset in 0..CACHELINE {
                    store_page_diff(rt, &mut cache, &serial, index + offset, page + offset * PAGE_SIZE);
                }
                rt.write_buffer.erase(index);
                cache.lines[index].dirty = Dirtiness::Clean;
            }

            let classidx = layout.classification_index(page);
            let sharers = rt.dir.local_sharers(&serial, &rt.exchange, classidx);
            let writers = rt.dir.local_writers(&serial, &rt.exchange, classidx);
            let keep = writers == me_bit || (writers == 0 && sharers & me_bit == me_bit);
            if keep {
                cache.touched[index] = true;
            } else {
                cache.lines[index].dirty = Dirtiness::Clean;
                cache.lines[index].state = LineState::Invalid;
                cache.touched[index] = false;
                // SAFETY: as above.
                unsafe {
                    rt.vm
                        .protect((start + page) as *mut u8, layout.block_size, Protection::None)
                };
            }
        }
        page += layout.block_size;
    }
    cache.windows.close_all();
    Statistics::add_elapsed(&rt.stats.selective_acquire_time, started);
}

/// Selective release: downgrade and write back the dirty units overlapping
/// `[addr, addr + len)`.
pub(crate) fn selective_release(rt: &Runtime, addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let started = Instant::now();
    let layout = &rt.layout;
    let start = rt.vm.start() as usize;
    assert!(rt.vm.contains(addr as usize), "selective release outside the global range");

    let gas_offset = addr as usize - start;
    let misalignment = gas_offset % layout.block_size;
    let first = align_backwards(gas_offset, layout.block_size);

    let mut cache = rt.cache.lock();
    let serial = rt.exchange.serialize();

    let mut page = first;
    while page < first + misalignment + len {
        let index = layout.cache_index(page);
        if cache.lines[index].tag == page && cache.lines[index].dirty == Dirtiness::Dirty {
            // SAFETY: resident dirty unit, under cache mutex.
            unsafe {
                rt.vm
                    .protect((start + page) as *mut u8, layout.block_size, Protection::Read)
            };
            for offset in 0..CACHELINE {
                store_page_diff(rt, &mut cache, &serial, index + offset, page + offset * PAGE_SIZE);
            }
            rt.write_buffer.erase(index);
            cache.lines[index].dirty = Dirtiness::Clean;
        }
        page += layout.block_size;
    }
    cache.windows.close_all();
    Statistics::add_elapsed(&rt.stats.selective_release_time, started);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_runs_empty_when_identical() {
        let a = vec![7u8; 64];
        assert!(diff_runs(&a, &a).is_empty());
    }

    #[test]
    fn test_diff_runs_coalesces_adjacent_bytes() {
        let twin = vec![0u8; 16];
        let mut current = twin.clone();
        current[3] = 1;
        current[4] = 2;
        current[5] = 3;
        current[9] = 9;
        assert_eq!(diff_runs(&current, &twin), vec![(3, 3), (9, 1)]);
    }

    #[test]
    fn test_diff_runs_tail_run() {
        let twin = vec![0u8; 8];
        let mut current = twin.clone();
        current[6] = 1;
        current[7] = 1;
        assert_eq!(diff_runs(&current, &twin), vec![(6, 2)]);
    }

    #[test]
    fn test_diff_runs_whole_page() {
        let twin = vec![0u8; 32];
        let current = vec![1u8; 32];
        assert_eq!(diff_runs(&current, &twin), vec![(0, 32)]);
    }
}
