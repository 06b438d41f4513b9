//! Error types for Vela.

use thiserror::Error;

/// Result type alias using Vela's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Vela operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (bad environment value, cache below minimum,
    /// more nodes than bitmask bits).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A backing resource could not be obtained or is used up.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// Virtual memory reservation or mapping failed.
    #[error("virtual memory error: {0}")]
    Vm(String),

    /// An application signal handler was installed before the runtime's own.
    #[error("runtime must capture the fault signal before application handlers can be installed")]
    HandlerOrder,

    /// Unsupported argument to a global atomic (size or alignment).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
