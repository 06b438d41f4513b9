//! Runtime assembly and the public operation surface.
//!
//! Every process-wide singleton of the system (virtual region, exchange,
//! page cache, write buffer, directory, statistics) lives inside one
//! [`Runtime`] object built at [`init`] and threaded through every
//! operation. The only module-level storage is the cell holding the
//! runtime itself, which the signal dispatcher needs to reach from a
//! fault.

use crate::cache::PageCache;
use crate::coherence;
use crate::directory::Directory;
use crate::distribution::Distribution;
use crate::env::{Config, Policy};
use crate::error::{Error, Result};
use crate::layout::{Layout, CACHELINE, PAGE_SIZE};
use crate::stats::Statistics;
use crate::sync::ThreadBarrier;
use crate::transport::Exchange;
use crate::vm::{Protection, VirtualRegion};
use crate::write_buffer::WriteBuffer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// The assembled runtime: every singleton of the system, in teardown
/// order.
pub(crate) struct Runtime {
    pub config: Config,
    pub layout: Layout,
    pub node_id: usize,
    pub vm: VirtualRegion,
    pub exchange: Exchange,
    pub dist: Distribution,
    pub dir: Directory,
    pub cache: Mutex<PageCache>,
    pub write_buffer: WriteBuffer,
    pub stats: Statistics,
    /// Thread barriers per participant count, created on first use.
    barriers: Mutex<HashMap<usize, Arc<ThreadBarrier>>>,
    finalized: AtomicBool,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process runtime.
///
/// # Panics
///
/// Panics when called before [`init`].
pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME
        .get()
        .expect("the runtime is not initialized; call vela::init first")
}

/// The process runtime, if initialized. Used by the signal dispatcher,
/// which must forward faults raised before init.
pub(crate) fn try_runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

impl Runtime {
    /// The thread barrier for `threadcount` participants.
    fn thread_barrier(&self, threadcount: usize) -> Arc<ThreadBarrier> {
        let mut barriers = self.barriers.lock();
        Arc::clone(
            barriers
                .entry(threadcount)
                .or_insert_with(|| Arc::new(ThreadBarrier::new(threadcount))),
        )
    }
}

/// Initialize the runtime.
///
/// `memory_size` is the requested global address space and `cache_size`
/// the local page cache, both in bytes; zero means "use the environment".
/// Must be called exactly once per process, by one thread, before any
/// global memory is used. Collective: every node of the run must call it.
pub fn init(memory_size: usize, cache_size: usize) -> Result<()> {
    let config = Config::from_env(memory_size, cache_size)?;
    let layout = Layout::new(&config);
    let node_id = config.node_id;

    tracing::info!(
        node_id,
        nodes = config.node_count,
        total_size = layout.total_size,
        cache_pages = layout.cache_pages,
        policy = ?layout.policy,
        "initializing"
    );

    let cache_bytes = layout.cache_pages * PAGE_SIZE;
    let vm = VirtualRegion::reserve(layout.total_size, cache_bytes)?;
    let exchange = Exchange::attach(
        &layout,
        node_id,
        layout.policy == Policy::FirstTouch,
        config.exchange_path.as_deref(),
    )?;
    let cache_view = vm.map_cache_linear()?;
    let cache = PageCache::new(&layout, cache_view, config.node_count);
    let dist = Distribution::new(&layout, node_id);
    let write_buffer = WriteBuffer::new(
        config.write_buffer_size / CACHELINE,
        config.write_buffer_write_back_size / CACHELINE,
    );

    let runtime = Runtime {
        layout,
        node_id,
        vm,
        exchange,
        dist,
        dir: Directory::new(node_id),
        cache: Mutex::new(cache),
        write_buffer,
        stats: Statistics::default(),
        barriers: Mutex::new(HashMap::new()),
        finalized: AtomicBool::new(false),
        config,
    };

    RUNTIME
        .set(runtime)
        .map_err(|_| Error::Config("the runtime is already initialized".into()))?;
    let rt = RUNTIME.get().expect("just initialized");

    // The fault handler must be in place before the first global access;
    // application handlers installed earlier are a configuration error by
    // contract.
    crate::signal::install_runtime_handler()?;

    // Directory and data shares start zeroed, the whole global range is
    // inaccessible; one barrier and every node agrees on that state.
    rt.exchange.barrier();
    rt.stats.clear();
    tracing::debug!(node_id, "initialized");
    Ok(())
}

/// Tear down the runtime. Collective: every node must call it.
///
/// Synchronizes all outstanding writes, emits statistics when configured,
/// and leaves the global range mapped read-write so late application
/// accesses cannot fault into a dead runtime. Operating system resources
/// are reclaimed when the process exits.
pub fn finalize() {
    let rt = runtime();
    if rt.finalized.swap(true, Ordering::SeqCst) {
        return;
    }
    barrier(1);
    if rt.config.print_statistics {
        rt.stats.print(
            rt.node_id,
            rt.layout.cache_pages,
            rt.config.write_buffer_size,
        );
    }
    // SAFETY: the whole reserved range; protocol state no longer matters.
    unsafe {
        rt.vm
            .protect(rt.vm.start(), rt.vm.len(), Protection::ReadWrite);
    }
    rt.exchange.barrier();
    tracing::info!(node_id = rt.node_id, "finalized");
}

/// This process' node id, in `[0, number_of_nodes())`.
pub fn node_id() -> usize {
    runtime().node_id
}

/// Number of cooperating nodes in the run.
pub fn number_of_nodes() -> usize {
    runtime().exchange.nodes()
}

/// Base address of the global address space.
pub fn global_base() -> *mut u8 {
    runtime().vm.start()
}

/// Size of the global address space in bytes.
pub fn global_size() -> usize {
    runtime().vm.len()
}

/// Global barrier: every node, `threadcount` threads per node.
///
/// All participating threads block until the whole system arrives. One
/// thread per node flushes the write buffer, crosses the inter-node
/// barrier and self-invalidates; afterwards every participant observes all
/// writes ordered before the barrier anywhere in the system.
pub fn barrier(threadcount: usize) {
    let rt = runtime();
    let started = Instant::now();
    let thread_barrier = rt.thread_barrier(threadcount);

    if thread_barrier.wait() {
        let mut cache = rt.cache.lock();
        let serial = rt.exchange.serialize();
        coherence::flush_write_buffer(rt, &mut cache, &serial);
        rt.exchange.barrier();
        coherence::self_invalidation(rt, &mut cache, &serial);
    }
    thread_barrier.wait();

    Statistics::bump(&rt.stats.barriers);
    Statistics::add_elapsed(&rt.stats.barrier_time, started);
}

/// The acquire half of release consistency: make remote writes visible to
/// this node.
pub fn acquire() {
    let rt = runtime();
    let mut cache = rt.cache.lock();
    let serial = rt.exchange.serialize();
    coherence::self_invalidation(rt, &mut cache, &serial);
}

/// The release half of release consistency: make this node's writes
/// visible to acquirers.
pub fn release() {
    let rt = runtime();
    let mut cache = rt.cache.lock();
    let serial = rt.exchange.serialize();
    coherence::flush_write_buffer(rt, &mut cache, &serial);
}

/// Acquire and release in one step.
pub fn acq_rel() {
    acquire();
    release();
}

/// Selective acquire over `[addr, addr + len)` only: invalidate the local
/// copies of the touched units that other nodes may have written.
pub fn selective_acquire(addr: *const u8, len: usize) {
    coherence::selective_acquire(runtime(), addr, len);
}

/// Selective release over `[addr, addr + len)` only: push this node's
/// dirty data for the touched units to their homes.
pub fn selective_release(addr: *const u8, len: usize) {
    coherence::selective_release(runtime(), addr, len);
}
