//! Virtual memory region for the global address space.
//!
//! Every node reserves the same fixed virtual range, so a pointer into the
//! global address space means the same thing on every node. The range is
//! reserved inaccessible; the coherence engine later maps page runs onto
//! one of two backing objects (the private cache file or the shared
//! exchange segment) and flips their protection as the protocol dictates.

use crate::error::{Error, Result};
use crate::layout::PAGE_SIZE;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Fixed base of the global address space on every node.
///
/// Chosen well above typical heap and library mappings; reservation fails
/// fatally if anything already lives here.
pub const GAS_BASE: usize = 0x2000_0000_0000;

/// Page protection for a mapping in the global range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access: the next touch faults into the coherence engine.
    None,
    /// Read-only: the next write faults into the coherence engine.
    Read,
    /// Full access.
    ReadWrite,
}

impl Protection {
    fn map_flags(self) -> ProtFlags {
        match self {
            Protection::None => ProtFlags::empty(),
            Protection::Read => ProtFlags::READ,
            Protection::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
        }
    }

    fn protect_flags(self) -> MprotectFlags {
        match self {
            Protection::None => MprotectFlags::empty(),
            Protection::Read => MprotectFlags::READ,
            Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
        }
    }
}

/// The reserved virtual range plus the node-private cache backing.
pub struct VirtualRegion {
    /// Base of the reserved range (always `GAS_BASE`).
    base: NonNull<u8>,
    /// Length of the reserved range in bytes.
    len: usize,
    /// memfd backing the local page cache slots.
    cache_fd: OwnedFd,
    /// Size of the cache backing in bytes.
    cache_len: usize,
}

impl VirtualRegion {
    /// Reserve the global range and create the cache backing.
    ///
    /// The reservation is `PROT_NONE`, so until the coherence engine maps a
    /// page every access faults. Both failures here are fatal for the
    /// caller: without the fixed range the address space cannot be shared.
    pub fn reserve(len: usize, cache_len: usize) -> Result<Self> {
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                GAS_BASE as *mut _,
                len,
                ProtFlags::empty(),
                MapFlags::SHARED | MapFlags::FIXED_NOREPLACE,
            )
        }
        .map_err(|e| Error::Vm(format!("cannot reserve {len} bytes at {GAS_BASE:#x}: {e}")))?;

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::Vm("reservation returned null".into()))?;

        let cname = CString::new("vela-cache").expect("static name");
        let cache_fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::Vm(format!("cannot create cache backing: {e}")))?;
        rustix::fs::ftruncate(&cache_fd, cache_len as u64)
            .map_err(|e| Error::Vm(format!("cannot size cache backing: {e}")))?;

        Ok(VirtualRegion {
            base,
            len,
            cache_fd,
            cache_len,
        })
    }

    /// Base address of the global range.
    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Size of the global range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether `addr` falls inside the global range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr < start + self.len
    }

    /// The cache backing file descriptor.
    #[inline]
    pub fn cache_fd(&self) -> BorrowedFd<'_> {
        self.cache_fd.as_fd()
    }

    /// Map the whole cache backing read-write at a kernel-chosen address.
    ///
    /// This is the linear view the transport copies remote pages into; the
    /// global range aliases the same file offsets page by page.
    pub fn map_cache_linear(&self) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                self.cache_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.cache_fd,
                0,
            )
        }
        .map_err(|e| Error::Vm(format!("cannot map cache view: {e}")))?;
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Vm("cache view mapped null".into()))
    }

    /// Establish or replace a mapping inside the global range.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must lie inside the reserved range and be page
    /// aligned, and `offset..offset + len` must be valid for `fd`. The
    /// caller is replacing live mappings; it must hold whatever locks make
    /// that sound for the pages involved.
    pub unsafe fn map_memory(
        &self,
        addr: *mut u8,
        len: usize,
        fd: BorrowedFd<'_>,
        offset: usize,
        prot: Protection,
    ) {
        debug_assert!(self.contains(addr as usize));
        debug_assert_eq!(addr as usize % PAGE_SIZE, 0);
        let mapped = unsafe {
            rustix::mm::mmap(
                addr.cast(),
                len,
                prot.map_flags(),
                MapFlags::SHARED | MapFlags::FIXED,
                fd,
                offset as u64,
            )
        };
        // A refused replacement mapping leaves the coherence state and the
        // hardware view inconsistent; there is no way to continue.
        if mapped.is_err() {
            panic!(
                "failed to map {len} bytes of the global range at {:p}: {:?}",
                addr,
                mapped.unwrap_err()
            );
        }
    }

    /// Change the protection of an existing mapping in the global range.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::map_memory`].
    pub unsafe fn protect(&self, addr: *mut u8, len: usize, prot: Protection) {
        debug_assert!(self.contains(addr as usize));
        if let Err(e) = unsafe { rustix::mm::mprotect(addr.cast(), len, prot.protect_flags()) } {
            panic!("failed to protect {len} bytes at {addr:p}: {e}");
        }
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        // Return the reservation; the cache fd closes with OwnedFd.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the region is plain shared memory plus an fd; all mutation goes
// through raw pointers whose synchronization is the caller's contract.
unsafe impl Send for VirtualRegion {}
unsafe impl Sync for VirtualRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    // A single test: the reservation occupies the fixed base, so two tests
    // running on separate threads would collide on FIXED_NOREPLACE.
    #[test]
    fn test_reserve_map_and_protect() {
        let region = VirtualRegion::reserve(16 * PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        assert_eq!(region.start() as usize, GAS_BASE);
        assert!(region.contains(GAS_BASE + 1));
        assert!(!region.contains(GAS_BASE + 16 * PAGE_SIZE));

        // Write through the linear cache view, then map a global page onto
        // the same offset and read it back.
        let view = region.map_cache_linear().unwrap();
        unsafe {
            *view.as_ptr().add(2 * PAGE_SIZE) = 0xAB;
            region.map_memory(
                region.start(),
                PAGE_SIZE,
                region.cache_fd(),
                2 * PAGE_SIZE,
                Protection::Read,
            );
            assert_eq!(*region.start(), 0xAB);
        }

        // Remap a different slot read-write and downgrade it.
        unsafe {
            region.map_memory(
                region.start(),
                PAGE_SIZE,
                region.cache_fd(),
                0,
                Protection::ReadWrite,
            );
            *region.start() = 7;
            region.protect(region.start(), PAGE_SIZE, Protection::Read);
            assert_eq!(*region.start(), 7);
        }
    }
}
