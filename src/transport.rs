//! Exchange transport: the boundary between node processes.
//!
//! Every node maps one shared "exchange" segment containing, per node, its
//! authoritative share of the global data, its classification directory
//! array, its lock window and (under first-touch) its ownership tables. On
//! top of that mapping the transport exposes the one-sided verb set the
//! coherence protocol is written against: `get`/`put` window sessions on
//! remote data, atomic accumulate/fetch-or/compare-exchange on directory
//! and lock words, an inter-node barrier and a small broadcast.
//!
//! A process-wide serialization point protects the transport; every verb
//! takes a [`SerializerGuard`] witness so the requirement is checked at
//! compile time. Lock order across the crate is cache mutex first, then
//! the serializer; no code path may invert this.
//!
//! The segment is created by node 0, attached by everyone, and unlinked as
//! soon as all nodes have arrived, so no state outlives the run. A
//! single-node run skips the rendezvous entirely and backs the exchange
//! with an anonymous memfd.

use crate::error::{Error, Result};
use crate::layout::{align_forwards, Layout, PAGE_SIZE};
use parking_lot::{Mutex, MutexGuard};
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// Identifies a mapped exchange segment of this crate version.
const EXCHANGE_MAGIC: u64 = 0x56454c_41584531; // "VELAXE1"

/// Initial value of every lock window word: never owned.
pub const LOCK_INIT: u64 = u64::MAX;

/// Number of lock slots in each node's lock window.
pub const LOCK_SLOTS: usize = PAGE_SIZE / 8;

/// Witness that the transport serialization point is held.
pub type SerializerGuard<'a> = MutexGuard<'a, ()>;

/// Shared coordination words at the start of the exchange segment.
#[repr(C)]
struct Header {
    magic: AtomicU64,
    node_count: AtomicU64,
    total_size: AtomicU64,
    attached: AtomicU64,
    barrier_arrivals: AtomicU64,
    barrier_generation: AtomicU64,
    arena_cursor: AtomicU64,
}

/// Byte offsets of the per-node slices inside the segment.
#[derive(Debug, Clone)]
struct Spans {
    /// Size of one node's whole slice.
    node_span: usize,
    /// Authoritative data share per node.
    size_per_node: usize,
    /// Directory array bytes (page aligned).
    directory_bytes: usize,
    /// Ownership table bytes (zero unless first-touch).
    owners_bytes: usize,
    /// Offsets table bytes (zero unless first-touch).
    offsets_bytes: usize,
}

impl Spans {
    fn new(layout: &Layout, first_touch: bool) -> Self {
        let directory_bytes = align_forwards(layout.classification_size * 8, PAGE_SIZE);
        let owners_bytes = if first_touch {
            align_forwards(3 * layout.total_pages() * 8, PAGE_SIZE)
        } else {
            0
        };
        let offsets_bytes = if first_touch { PAGE_SIZE } else { 0 };
        Spans {
            node_span: layout.size_per_node
                + directory_bytes
                + PAGE_SIZE
                + owners_bytes
                + offsets_bytes,
            size_per_node: layout.size_per_node,
            directory_bytes,
            owners_bytes,
            offsets_bytes,
        }
    }

    /// Total segment size for `nodes` nodes: header page, broadcast page,
    /// then the node slices.
    fn segment_len(&self, nodes: usize) -> usize {
        2 * PAGE_SIZE + nodes * self.node_span
    }

    fn node_base(&self, node: usize) -> usize {
        2 * PAGE_SIZE + node * self.node_span
    }

    fn data_offset(&self, node: usize) -> usize {
        self.node_base(node)
    }

    fn directory_offset(&self, node: usize) -> usize {
        self.node_base(node) + self.size_per_node
    }

    fn lock_offset(&self, node: usize) -> usize {
        self.directory_offset(node) + self.directory_bytes
    }

    fn owners_offset(&self, node: usize) -> usize {
        self.lock_offset(node) + PAGE_SIZE
    }

    fn offsets_offset(&self, node: usize) -> usize {
        self.owners_offset(node) + self.owners_bytes
    }
}

/// Tracks which remote data windows have an open put session.
///
/// Sessions are opened lazily, once per home node, and closed only after
/// the whole batch of writes targeting that home is complete, which is why
/// the write buffer sorts before flushing.
pub struct DataWindows {
    open: Vec<bool>,
}

impl DataWindows {
    pub fn new(nodes: usize) -> Self {
        DataWindows {
            open: vec![false; nodes],
        }
    }

    /// Open a session towards `home` if none is open. Returns true when a
    /// new session was started.
    pub fn ensure_open(&mut self, home: usize) -> bool {
        if self.open[home] {
            false
        } else {
            self.open[home] = true;
            true
        }
    }

    /// Close every open session.
    pub fn close_all(&mut self) {
        for flag in &mut self.open {
            *flag = false;
        }
    }

    /// Whether any session is open.
    pub fn any_open(&self) -> bool {
        self.open.iter().any(|f| *f)
    }
}

/// The mapped exchange segment plus the transport serialization point.
pub struct Exchange {
    /// Backing file descriptor; also the mapping source for locally homed
    /// pages of the global range.
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    nodes: usize,
    node_id: usize,
    spans: Spans,
    classification_size: usize,
    serializer: Mutex<()>,
}

impl Exchange {
    /// Create or attach the exchange segment for this node.
    ///
    /// `path` is required for multi-node runs; node 0 creates the file and
    /// unlinks it once every node has attached. Single-node runs use an
    /// anonymous memfd.
    pub fn attach(
        layout: &Layout,
        node_id: usize,
        first_touch: bool,
        path: Option<&str>,
    ) -> Result<Self> {
        let nodes = layout.nodes;
        let spans = Spans::new(layout, first_touch);
        let len = spans.segment_len(nodes);

        let fd = match (nodes, path) {
            (1, _) => {
                let cname = CString::new("vela-exchange").expect("static name");
                let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
                rustix::fs::ftruncate(&fd, len as u64)?;
                fd
            }
            (_, Some(path)) if node_id == 0 => {
                let fd = rustix::fs::open(
                    path,
                    OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
                    Mode::RUSR | Mode::WUSR,
                )
                .map_err(|e| Error::Config(format!("cannot create exchange {path}: {e}")))?;
                rustix::fs::ftruncate(&fd, len as u64)?;
                fd
            }
            (_, Some(path)) => Self::open_rendezvous(path, len)?,
            (_, None) => {
                return Err(Error::Config(
                    "multi-node run without an exchange rendezvous path".into(),
                ))
            }
        };

        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| Error::Vm(format!("cannot map exchange segment: {e}")))?;
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::Vm("exchange mapped null".into()))?;

        let exchange = Exchange {
            fd,
            base,
            len,
            nodes,
            node_id,
            spans,
            classification_size: layout.classification_size,
            serializer: Mutex::new(()),
        };

        // Every node seeds its own lock window before announcing itself;
        // the attach counter below publishes the writes.
        for slot in 0..LOCK_SLOTS {
            exchange.lock_word_local(node_id, slot).store(LOCK_INIT, Ordering::Relaxed);
        }
        if first_touch {
            let words = 3 * layout.total_pages();
            for idx in 0..words {
                exchange
                    .owners_word_local(node_id, idx)
                    .store(layout.tag_none as u64, Ordering::Relaxed);
            }
        }

        if node_id == 0 {
            exchange.header().node_count.store(nodes as u64, Ordering::Relaxed);
            exchange
                .header()
                .total_size
                .store(layout.total_size as u64, Ordering::Relaxed);
            exchange.header().magic.store(EXCHANGE_MAGIC, Ordering::Release);
        } else {
            while exchange.header().magic.load(Ordering::Acquire) != EXCHANGE_MAGIC {
                std::thread::yield_now();
            }
            if exchange.header().node_count.load(Ordering::Relaxed) != nodes as u64
                || exchange.header().total_size.load(Ordering::Relaxed)
                    != layout.total_size as u64
            {
                return Err(Error::Config(
                    "exchange segment was created with a different layout".into(),
                ));
            }
        }

        exchange.header().attached.fetch_add(1, Ordering::AcqRel);
        while exchange.header().attached.load(Ordering::Acquire) < nodes as u64 {
            std::thread::yield_now();
        }

        // No persistent state: the rendezvous file disappears as soon as
        // every node holds the mapping.
        if node_id == 0 && nodes > 1 {
            if let Some(path) = path {
                let _ = std::fs::remove_file(path);
            }
        }

        tracing::debug!(node_id, nodes, len, "exchange attached");
        Ok(exchange)
    }

    /// Open the rendezvous file, waiting for node 0 to create and size it.
    fn open_rendezvous(path: &str, len: usize) -> Result<OwnedFd> {
        loop {
            match rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => {
                    let stat = rustix::fs::fstat(&fd)?;
                    if stat.st_size as usize >= len {
                        return Ok(fd);
                    }
                }
                Err(rustix::io::Errno::NOENT) => {}
                Err(e) => return Err(e.into()),
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn header(&self) -> &Header {
        // SAFETY: offset 0 holds the header; the mapping outlives &self.
        unsafe { &*self.base.as_ptr().cast::<Header>() }
    }

    /// Take the transport serialization point.
    pub fn serialize(&self) -> SerializerGuard<'_> {
        self.serializer.lock()
    }

    /// Number of nodes attached to this exchange.
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.len);
        // SAFETY: offset checked against the mapping length.
        unsafe { self.base.as_ptr().add(offset) }
    }

    #[inline]
    fn word_at(&self, offset: usize) -> &AtomicU64 {
        debug_assert_eq!(offset % 8, 0);
        // SAFETY: inside the mapping, aligned, and the mapping outlives &self.
        unsafe { &*self.at(offset).cast::<AtomicU64>() }
    }

    // ------------------------------------------------------------------
    // Data windows
    // ------------------------------------------------------------------

    /// Raw pointer into `node`'s data share.
    #[inline]
    pub fn data_ptr(&self, node: usize, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.spans.size_per_node);
        self.at(self.spans.data_offset(node) + offset)
    }

    /// One-sided read of `len` bytes from `home`'s data share.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes and `offset + len` must stay
    /// inside one node's share. Concurrent writers to the same bytes are a
    /// data race in the application (DRF contract).
    pub unsafe fn get(
        &self,
        _serial: &SerializerGuard<'_>,
        home: usize,
        offset: usize,
        dst: *mut u8,
        len: usize,
    ) {
        debug_assert!(offset + len <= self.spans.size_per_node);
        unsafe { std::ptr::copy_nonoverlapping(self.data_ptr(home, offset), dst, len) };
    }

    /// One-sided write of `len` bytes into `home`'s data share.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::get`], with `src` valid for `len` bytes.
    /// The caller must have an open window session towards `home`.
    pub unsafe fn put(
        &self,
        _serial: &SerializerGuard<'_>,
        home: usize,
        offset: usize,
        src: *const u8,
        len: usize,
    ) {
        debug_assert!(offset + len <= self.spans.size_per_node);
        unsafe { std::ptr::copy_nonoverlapping(src, self.data_ptr(home, offset), len) };
    }

    /// Atomic view of a word in `home`'s data share, used by the global
    /// atomics. Fails on misalignment; size dispatch lives in the caller.
    pub fn data_atomic_u64(&self, home: usize, offset: usize) -> Result<&AtomicU64> {
        self.data_atomic(home, offset)
    }

    /// See [`Self::data_atomic_u64`].
    pub fn data_atomic_u32(&self, home: usize, offset: usize) -> Result<&AtomicU32> {
        self.data_atomic(home, offset)
    }

    /// See [`Self::data_atomic_u64`].
    pub fn data_atomic_u16(&self, home: usize, offset: usize) -> Result<&AtomicU16> {
        self.data_atomic(home, offset)
    }

    /// See [`Self::data_atomic_u64`].
    pub fn data_atomic_u8(&self, home: usize, offset: usize) -> Result<&AtomicU8> {
        self.data_atomic(home, offset)
    }

    fn data_atomic<A>(&self, home: usize, offset: usize) -> Result<&A> {
        let size = std::mem::size_of::<A>();
        if offset % size != 0 {
            return Err(Error::InvalidArgument(format!(
                "atomic of size {size} at misaligned global offset {offset:#x}"
            )));
        }
        if offset + size > self.spans.size_per_node {
            return Err(Error::InvalidArgument(format!(
                "atomic at offset {offset:#x} outside the node share"
            )));
        }
        // SAFETY: aligned, in bounds, and the mapping outlives &self.
        Ok(unsafe { &*self.data_ptr(home, offset).cast::<A>() })
    }

    // ------------------------------------------------------------------
    // Directory window
    // ------------------------------------------------------------------

    /// Word `index` of `node`'s classification directory array.
    #[inline]
    pub fn directory_word(&self, node: usize, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.classification_size);
        self.word_at(self.spans.directory_offset(node) + index * 8)
    }

    // ------------------------------------------------------------------
    // Lock window
    // ------------------------------------------------------------------

    /// Lock slot `slot`, hosted on node `slot % nodes`.
    #[inline]
    pub fn lock_word(&self, slot: usize) -> &AtomicU64 {
        self.lock_word_local(slot % self.nodes, slot)
    }

    #[inline]
    fn lock_word_local(&self, node: usize, slot: usize) -> &AtomicU64 {
        debug_assert!(slot < LOCK_SLOTS);
        self.word_at(self.spans.lock_offset(node) + (slot % LOCK_SLOTS) * 8)
    }

    // ------------------------------------------------------------------
    // First-touch tables
    // ------------------------------------------------------------------

    /// Word `index` of `node`'s ownership directory.
    #[inline]
    pub fn owners_word(&self, node: usize, index: usize) -> &AtomicU64 {
        self.owners_word_local(node, index)
    }

    #[inline]
    fn owners_word_local(&self, node: usize, index: usize) -> &AtomicU64 {
        debug_assert!(index * 8 < self.spans.owners_bytes);
        self.word_at(self.spans.owners_offset(node) + index * 8)
    }

    /// Word `index` of `node`'s backing-store offsets table. Word `n` on
    /// node `n` is the authoritative allocation cursor of node `n`.
    #[inline]
    pub fn offsets_word(&self, node: usize, index: usize) -> &AtomicU64 {
        debug_assert!(index * 8 < self.spans.offsets_bytes);
        self.word_at(self.spans.offsets_offset(node) + index * 8)
    }

    // ------------------------------------------------------------------
    // Collectives
    // ------------------------------------------------------------------

    /// Cursor of the global arena, shared by all nodes.
    pub fn arena_cursor(&self) -> &AtomicU64 {
        &self.header().arena_cursor
    }

    /// Inter-node barrier. Blocks until every node has arrived.
    pub fn barrier(&self) {
        if self.nodes == 1 {
            return;
        }
        let header = self.header();
        let generation = header.barrier_generation.load(Ordering::Acquire);
        let arrived = header.barrier_arrivals.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.nodes as u64 {
            header.barrier_arrivals.store(0, Ordering::Relaxed);
            header.barrier_generation.fetch_add(1, Ordering::Release);
        } else {
            while header.barrier_generation.load(Ordering::Acquire) == generation {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }

    /// Broadcast `buf` from `root` to every node. `buf` must fit the
    /// scratch page.
    pub fn broadcast(&self, _serial: &SerializerGuard<'_>, root: usize, buf: &mut [u8]) {
        assert!(buf.len() <= PAGE_SIZE, "broadcast payload exceeds one page");
        let scratch = self.at(PAGE_SIZE);
        if self.node_id == root {
            // SAFETY: scratch page is inside the mapping.
            unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), scratch, buf.len()) };
        }
        self.barrier();
        if self.node_id != root {
            // SAFETY: as above.
            unsafe { std::ptr::copy_nonoverlapping(scratch, buf.as_mut_ptr(), buf.len()) };
        }
        self.barrier();
    }

    /// Offset of `node`'s data share inside the exchange segment, for
    /// mapping locally homed pages straight into the global range.
    pub fn data_segment_offset(&self, node: usize) -> usize {
        self.spans.data_offset(node)
    }

    /// The exchange file descriptor, for global-range mappings.
    pub fn fd(&self) -> rustix::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: all shared mutation goes through atomics or raw-pointer verbs
// whose synchronization is the caller's contract (serializer witness).
unsafe impl Send for Exchange {}
unsafe impl Sync for Exchange {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Config, Policy};

    fn layout(nodes: usize) -> Layout {
        Layout::new(&Config {
            memory_size: 1 << 20,
            cache_size: 1 << 16,
            write_buffer_size: 512,
            write_buffer_write_back_size: 32,
            policy: Policy::Naive,
            allocation_block_size: 16,
            print_statistics: false,
            node_id: 0,
            node_count: nodes,
            exchange_path: None,
        })
    }

    #[test]
    fn test_single_node_attach_and_verbs() {
        let layout = layout(1);
        let exchange = Exchange::attach(&layout, 0, false, None).unwrap();

        let serial = exchange.serialize();
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        unsafe {
            exchange.put(&serial, 0, 128, src.as_ptr(), src.len());
            exchange.get(&serial, 0, 128, dst.as_mut_ptr(), dst.len());
        }
        assert_eq!(src, dst);

        // Lock words start at the never-owned sentinel.
        assert_eq!(exchange.lock_word(0).load(Ordering::Relaxed), LOCK_INIT);

        // Directory words start clear.
        assert_eq!(exchange.directory_word(0, 0).load(Ordering::Relaxed), 0);
        exchange.directory_word(0, 0).fetch_or(0b10, Ordering::Relaxed);
        assert_eq!(exchange.directory_word(0, 0).load(Ordering::Relaxed), 0b10);
    }

    #[test]
    fn test_data_atomics_check_alignment() {
        let layout = layout(1);
        let exchange = Exchange::attach(&layout, 0, false, None).unwrap();
        assert!(exchange.data_atomic_u64(0, 8).is_ok());
        assert!(exchange.data_atomic_u64(0, 4).is_err());
        assert!(exchange.data_atomic_u32(0, 4).is_ok());
        assert!(exchange.data_atomic_u32(0, 2).is_err());
    }

    #[test]
    fn test_two_attachers_rendezvous_and_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exchange").to_str().unwrap().to_string();

        let layout0 = layout(2);
        let layout1 = layout0.clone();
        let path1 = path.clone();

        let peer = std::thread::spawn(move || {
            let exchange = Exchange::attach(&layout1, 1, false, Some(&path1)).unwrap();
            exchange.barrier();
            exchange.directory_word(1, 4).fetch_or(1, Ordering::Relaxed);
            exchange.barrier();
        });

        let exchange = Exchange::attach(&layout0, 0, false, Some(&path)).unwrap();
        exchange.barrier();
        exchange.barrier();
        // Node 1's one-sided update is visible through node 0's mapping.
        assert_eq!(exchange.directory_word(1, 4).load(Ordering::Relaxed), 1);
        peer.join().unwrap();

        // The rendezvous file is unlinked once everyone attached.
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_data_windows_track_sessions() {
        let mut windows = DataWindows::new(4);
        assert!(windows.ensure_open(2));
        assert!(!windows.ensure_open(2));
        assert!(windows.any_open());
        windows.close_all();
        assert!(!windows.any_open());
    }
}
