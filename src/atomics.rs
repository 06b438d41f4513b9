//! Atomic operations on global addresses.
//!
//! Operations dispatch on the element size (1, 2, 4 or 8 bytes) to the
//! matching one-sided primitive on the home node of the word. Any other
//! size, and any misaligned address, is rejected as an invalid argument
//! rather than a fatal error.
//!
//! The `order` parameter follows release consistency: a `Release` (or
//! `AcqRel`) operation flushes this node's writes first; an `Acquire` (or
//! `AcqRel`) operation self-invalidates afterwards, so subsequent reads
//! see remote writes ordered before the atomic. `Relaxed` performs only
//! the atomic itself, which is still linearizable per word.

use crate::distribution::GlobalPtr;
use crate::error::{Error, Result};
use crate::runtime::{runtime, Runtime};
use std::sync::atomic::Ordering;

/// Memory ordering of a global atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryOrder {
    /// No synchronization beyond the atomic itself.
    Relaxed,
    /// Self-invalidate after the operation.
    Acquire,
    /// Flush the write buffer before the operation.
    Release,
    /// Both of the above.
    #[default]
    AcqRel,
}

impl MemoryOrder {
    fn releases(self) -> bool {
        matches!(self, MemoryOrder::Release | MemoryOrder::AcqRel)
    }
    fn acquires(self) -> bool {
        matches!(self, MemoryOrder::Acquire | MemoryOrder::AcqRel)
    }
}

/// Integer types storable in a global word, with the bit conversions used
/// by the size dispatch.
pub trait GlobalInteger: Copy {
    #[doc(hidden)]
    fn into_bits(self) -> u64;
    #[doc(hidden)]
    fn from_bits(bits: u64) -> Self;
}

macro_rules! global_integer {
    ($($t:ty),*) => {$(
        impl GlobalInteger for $t {
            #[inline]
            fn into_bits(self) -> u64 {
                self as u64
            }
            #[inline]
            fn from_bits(bits: u64) -> Self {
                bits as $t
            }
        }
    )*};
}
global_integer!(u8, u16, u32, u64, i8, i16, i32, i64, usize, isize);

/// Resolve the home node and local offset of a global pointer.
fn locate<T>(rt: &Runtime, ptr: GlobalPtr<T>) -> (usize, usize) {
    let gas_offset = ptr.gas_offset();
    let home = rt.dist.homenode(&rt.exchange, gas_offset);
    let offset = rt.dist.local_offset(&rt.exchange, gas_offset);
    (home, offset)
}

macro_rules! dispatch_on_size {
    ($rt:expr, $home:expr, $offset:expr, $size:expr, |$atom:ident| $op:expr) => {
        match $size {
            1 => {
                let $atom = $rt.exchange.data_atomic_u8($home, $offset)?;
                let result = $op;
                result as u64
            }
            2 => {
                let $atom = $rt.exchange.data_atomic_u16($home, $offset)?;
                let result = $op;
                result as u64
            }
            4 => {
                let $atom = $rt.exchange.data_atomic_u32($home, $offset)?;
                let result = $op;
                result as u64
            }
            8 => {
                let $atom = $rt.exchange.data_atomic_u64($home, $offset)?;
                let result = $op;
                result as u64
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported atomic element size {other}"
                )))
            }
        }
    };
}

/// Atomically replace the word at `ptr`, returning the previous value.
pub fn exchange<T: GlobalInteger>(ptr: GlobalPtr<T>, desired: T, order: MemoryOrder) -> Result<T> {
    let rt = runtime();
    if order.releases() {
        crate::release();
    }
    let (home, offset) = locate(rt, ptr);
    let bits = desired.into_bits();
    let old = {
        let _serial = rt.exchange.serialize();
        dispatch_on_size!(rt, home, offset, std::mem::size_of::<T>(), |atom| atom
            .swap(bits as _, Ordering::SeqCst))
    };
    if order.acquires() {
        crate::acquire();
    }
    Ok(T::from_bits(old))
}

/// Atomically store `value` at `ptr`.
pub fn store<T: GlobalInteger>(ptr: GlobalPtr<T>, value: T, order: MemoryOrder) -> Result<()> {
    let rt = runtime();
    if order.releases() {
        crate::release();
    }
    let (home, offset) = locate(rt, ptr);
    let bits = value.into_bits();
    {
        let _serial = rt.exchange.serialize();
        dispatch_on_size!(rt, home, offset, std::mem::size_of::<T>(), |atom| {
            atom.store(bits as _, Ordering::SeqCst);
            0
        });
    }
    if order.acquires() {
        crate::acquire();
    }
    Ok(())
}

/// Atomically read the word at `ptr`.
pub fn load<T: GlobalInteger>(ptr: GlobalPtr<T>, order: MemoryOrder) -> Result<T> {
    let rt = runtime();
    if order.releases() {
        crate::release();
    }
    let (home, offset) = locate(rt, ptr);
    let bits = {
        let _serial = rt.exchange.serialize();
        dispatch_on_size!(rt, home, offset, std::mem::size_of::<T>(), |atom| atom
            .load(Ordering::SeqCst))
    };
    if order.acquires() {
        crate::acquire();
    }
    Ok(T::from_bits(bits))
}

/// Atomically compare-and-exchange the word at `ptr`, returning the value
/// found (equal to `expected` exactly when the exchange happened).
pub fn compare_exchange<T: GlobalInteger>(
    ptr: GlobalPtr<T>,
    expected: T,
    desired: T,
    order: MemoryOrder,
) -> Result<T> {
    let rt = runtime();
    if order.releases() {
        crate::release();
    }
    let (home, offset) = locate(rt, ptr);
    let expected_bits = expected.into_bits();
    let desired_bits = desired.into_bits();
    let found = {
        let _serial = rt.exchange.serialize();
        dispatch_on_size!(rt, home, offset, std::mem::size_of::<T>(), |atom| {
            match atom.compare_exchange(
                expected_bits as _,
                desired_bits as _,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(previous) => previous,
                Err(previous) => previous,
            }
        })
    };
    if order.acquires() {
        crate::acquire();
    }
    Ok(T::from_bits(found))
}

/// Atomically add `value` to the word at `ptr`, returning the previous
/// value. Wraps on overflow.
pub fn fetch_add<T: GlobalInteger>(ptr: GlobalPtr<T>, value: T, order: MemoryOrder) -> Result<T> {
    let rt = runtime();
    if order.releases() {
        crate::release();
    }
    let (home, offset) = locate(rt, ptr);
    let bits = value.into_bits();
    let old = {
        let _serial = rt.exchange.serialize();
        dispatch_on_size!(rt, home, offset, std::mem::size_of::<T>(), |atom| atom
            .fetch_add(bits as _, Ordering::SeqCst))
    };
    if order.acquires() {
        crate::acquire();
    }
    Ok(T::from_bits(old))
}

/// Atomically advance a global pointer-to-pointer by `count` elements,
/// returning the previous pointer. The addend is scaled by the pointee
/// size, mirroring pointer arithmetic.
pub fn fetch_add_ptr<T>(
    ptr: GlobalPtr<*mut T>,
    count: usize,
    order: MemoryOrder,
) -> Result<*mut T> {
    let scaled = count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(|| Error::InvalidArgument("pointer fetch-add overflows".into()))?;
    let old = fetch_add(ptr.cast::<usize>(), scaled, order)?;
    Ok(old as *mut T)
}
