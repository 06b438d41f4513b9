//! # Vela
//!
//! A page-based software distributed shared memory runtime: N cooperating
//! node processes present one contiguous address range that behaves like
//! ordinary memory. Loads and stores just work, pointers are portable
//! between nodes, and synchronization primitives span the whole system.
//!
//! Coherence is maintained lazily under release consistency for data-race
//! free programs: each page has a home node that authoritatively stores
//! it, other nodes cache copies fetched on fault, and writes propagate as
//! byte diffs at synchronization points (barriers, locks, acquire/release
//! and their selective variants).
//!
//! ## Features
//!
//! - **Fault-driven coherence**: single-writer / multiple-reader protocol
//!   with twin pages and diff-based write-back
//! - **Pluggable data distribution**: naive, cyclic, skew-mapp,
//!   prime-mapp and first-touch home-node policies
//! - **Global atomics**: exchange, compare-exchange and fetch-add on any
//!   naturally aligned global word
//! - **Hierarchical locking**: a global test-and-set lock and a cohort
//!   lock preferring NUMA-local hand-overs
//! - **Linux-native transport**: one shared memfd exchange segment per
//!   run, one-sided access, no daemons
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! vela::init(0, 0)?; // sizes from the environment
//!
//! let counter = vela::alloc_collective_array::<u64>(1)?;
//! if vela::node_id() == 0 {
//!     unsafe { counter.write(42) };
//! }
//! vela::barrier(1);
//! assert_eq!(unsafe { counter.read() }, 42);
//!
//! vela::finalize();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod atomics;
pub mod error;
pub mod sync;

mod arena;
mod cache;
mod coherence;
mod directory;
mod distribution;
mod env;
mod layout;
mod runtime;
mod signal;
mod stats;
mod transport;
mod vm;
mod write_buffer;

pub use arena::{alloc, alloc_array, alloc_collective, alloc_collective_array};
pub use distribution::GlobalPtr;
pub use error::{Error, Result};
pub use runtime::{
    acq_rel, acquire, barrier, finalize, global_base, global_size, init, node_id,
    number_of_nodes, release, selective_acquire, selective_release,
};
pub use signal::install_application_handler;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::atomics::{self, MemoryOrder};
    pub use crate::error::{Error, Result};
    pub use crate::sync::{CohortLock, GlobalTasLock};
    pub use crate::{
        acquire, alloc, alloc_array, alloc_collective, alloc_collective_array, barrier, finalize,
        init, node_id, number_of_nodes, release, selective_acquire, selective_release, GlobalPtr,
    };
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::env::{Config, Policy};
    use crate::layout::Layout;

    /// A layout for unit tests, bypassing the environment.
    pub fn test_layout_with_policy(nodes: usize, memory: usize, policy: Policy) -> Layout {
        Layout::new(&Config {
            memory_size: memory,
            cache_size: memory / 8,
            write_buffer_size: 512,
            write_buffer_write_back_size: 32,
            policy,
            allocation_block_size: 16,
            print_statistics: false,
            node_id: 0,
            node_count: nodes,
            exchange_path: None,
        })
    }

    /// See [`test_layout_with_policy`]; naive policy.
    pub fn test_layout(nodes: usize, memory: usize) -> Layout {
        test_layout_with_policy(nodes, memory, Policy::Naive)
    }
}
