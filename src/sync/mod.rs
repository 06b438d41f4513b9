//! Synchronization primitives.
//!
//! Node-local building blocks (the generation-counted thread barrier, the
//! MCS and ticket locks) and the cross-node locks built on the exchange
//! transport (the global test-and-set lock, the cohort lock).

mod cohort_lock;
mod mcs_lock;
mod numa;
mod tas_lock;
mod thread_barrier;
mod ticket_lock;

pub use cohort_lock::CohortLock;
pub use tas_lock::GlobalTasLock;

pub(crate) use mcs_lock::McsLock;
pub(crate) use thread_barrier::ThreadBarrier;
pub(crate) use ticket_lock::TicketLock;
