//! Environment-driven configuration.
//!
//! All tunables are read from the environment exactly once, at
//! [`crate::init`] time, so later changes to the process environment cannot
//! desynchronize the nodes of a running cluster.
//!
//! # Variables
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `ARGO_MEMORY_SIZE` | total global address space in bytes | 8 GiB |
//! | `ARGO_CACHE_SIZE` | local page cache in bytes | 1 GiB |
//! | `ARGO_WRITE_BUFFER_SIZE` | write buffer capacity in cache blocks | 512 |
//! | `ARGO_WRITE_BUFFER_WRITE_BACK_SIZE` | entries evicted per overflow | 32 |
//! | `ARGO_ALLOCATION_POLICY` | 0=naive 1=cyclic 2=skew-mapp 3=prime-mapp 4=first-touch | 0 |
//! | `ARGO_ALLOCATION_BLOCK_SIZE` | page block multiplier for the cyclic family | 16 |
//! | `ARGO_PRINT_STATISTICS` | emit run-end counters when nonzero | 0 |
//!
//! The node bootstrap (normally provided by the launcher) uses:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `VELA_NODE_ID` | this process' dense node id | 0 |
//! | `VELA_NODE_COUNT` | number of cooperating node processes | 1 |
//! | `VELA_EXCHANGE` | rendezvous path for the exchange segment | required if `VELA_NODE_COUNT > 1` |

use crate::error::{Error, Result};

/// Default requested memory size (if the environment variable is unset).
const DEFAULT_MEMORY_SIZE: usize = 8 << 30;
/// Default requested cache size (if the environment variable is unset).
const DEFAULT_CACHE_SIZE: usize = 1 << 30;
/// Default write buffer size in cache blocks.
const DEFAULT_WRITE_BUFFER_SIZE: usize = 512;
/// Default number of cache blocks written back on overflow.
const DEFAULT_WRITE_BUFFER_WRITE_BACK_SIZE: usize = 32;
/// Default allocation policy (naive).
const DEFAULT_ALLOCATION_POLICY: usize = 0;
/// Default allocation block size in pages.
const DEFAULT_ALLOCATION_BLOCK_SIZE: usize = 1 << 4;

/// The data-distribution policy selected for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Equally-sized per-node chunks, concatenated in node id order.
    Naive,
    /// Round-robin blocks of pages.
    Cyclic,
    /// Round-robin that skips one node every N blocks.
    SkewMapp,
    /// Two-phase round-robin over a `3N/2` period.
    PrimeMapp,
    /// Ownership assigned to the first node touching a page.
    FirstTouch,
}

impl Policy {
    fn from_number(n: usize) -> Result<Self> {
        match n {
            0 => Ok(Policy::Naive),
            1 => Ok(Policy::Cyclic),
            2 => Ok(Policy::SkewMapp),
            3 => Ok(Policy::PrimeMapp),
            4 => Ok(Policy::FirstTouch),
            other => Err(Error::Config(format!(
                "ARGO_ALLOCATION_POLICY must be 0..=4, got {other}"
            ))),
        }
    }
}

/// Snapshot of all configuration values, taken once at init.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total global address space in bytes (before rounding).
    pub memory_size: usize,
    /// Local page cache in bytes (before rounding).
    pub cache_size: usize,
    /// Write buffer capacity in cache blocks.
    pub write_buffer_size: usize,
    /// Cache blocks evicted per write buffer overflow (clamped to capacity).
    pub write_buffer_write_back_size: usize,
    /// Active data-distribution policy.
    pub policy: Policy,
    /// Page block multiplier for the cyclic policy family.
    pub allocation_block_size: usize,
    /// Whether to print run-end statistics at finalize.
    pub print_statistics: bool,
    /// This process' node id.
    pub node_id: usize,
    /// Number of cooperating node processes.
    pub node_count: usize,
    /// Rendezvous path for the exchange segment (multi-node runs only).
    pub exchange_path: Option<String>,
}

/// Parse an environment variable, falling back to a default when unset.
///
/// An unparsable value is a configuration error rather than a silent
/// fallback: every node must agree on these values, and a typo on one node
/// would otherwise produce diverging layouts.
fn parse_env(name: &str, fallback: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {value:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(fallback),
        Err(e) => Err(Error::Config(format!("{name}: {e}"))),
    }
}

impl Config {
    /// Read the full configuration from the environment.
    ///
    /// `memory_size` and `cache_size` arguments override the environment
    /// when nonzero, matching the init contract.
    pub fn from_env(memory_size: usize, cache_size: usize) -> Result<Self> {
        let env_memory = parse_env("ARGO_MEMORY_SIZE", DEFAULT_MEMORY_SIZE)?;
        let env_cache = parse_env("ARGO_CACHE_SIZE", DEFAULT_CACHE_SIZE)?;
        let write_buffer_size = parse_env("ARGO_WRITE_BUFFER_SIZE", DEFAULT_WRITE_BUFFER_SIZE)?;
        let write_back = parse_env(
            "ARGO_WRITE_BUFFER_WRITE_BACK_SIZE",
            DEFAULT_WRITE_BUFFER_WRITE_BACK_SIZE,
        )?;
        let policy = Policy::from_number(parse_env(
            "ARGO_ALLOCATION_POLICY",
            DEFAULT_ALLOCATION_POLICY,
        )?)?;
        let allocation_block_size = parse_env(
            "ARGO_ALLOCATION_BLOCK_SIZE",
            DEFAULT_ALLOCATION_BLOCK_SIZE,
        )?;
        let print_statistics = parse_env("ARGO_PRINT_STATISTICS", 0)? != 0;

        let node_id = parse_env("VELA_NODE_ID", 0)?;
        let node_count = parse_env("VELA_NODE_COUNT", 1)?;
        let exchange_path = std::env::var("VELA_EXCHANGE").ok();

        if node_count == 0 {
            return Err(Error::Config("VELA_NODE_COUNT must be at least 1".into()));
        }
        if node_count > u64::BITS as usize {
            return Err(Error::Config(format!(
                "VELA_NODE_COUNT {node_count} exceeds the {} bits of the sharer bitmask",
                u64::BITS
            )));
        }
        if node_id >= node_count {
            return Err(Error::Config(format!(
                "VELA_NODE_ID {node_id} out of range for {node_count} nodes"
            )));
        }
        if node_count > 1 && exchange_path.is_none() {
            return Err(Error::Config(
                "VELA_EXCHANGE must name a rendezvous path for multi-node runs".into(),
            ));
        }
        if write_buffer_size == 0 {
            return Err(Error::Config("ARGO_WRITE_BUFFER_SIZE must be nonzero".into()));
        }
        if allocation_block_size == 0 {
            return Err(Error::Config(
                "ARGO_ALLOCATION_BLOCK_SIZE must be nonzero".into(),
            ));
        }

        Ok(Config {
            memory_size: if memory_size != 0 { memory_size } else { env_memory },
            cache_size: if cache_size != 0 { cache_size } else { env_cache },
            write_buffer_size,
            // A write-back larger than the buffer itself can never flush
            // that many entries; clamp instead of failing.
            write_buffer_write_back_size: write_back.min(write_buffer_size).max(1),
            policy,
            allocation_block_size,
            print_statistics,
            node_id,
            node_count,
            exchange_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_numbers() {
        assert_eq!(Policy::from_number(0).unwrap(), Policy::Naive);
        assert_eq!(Policy::from_number(1).unwrap(), Policy::Cyclic);
        assert_eq!(Policy::from_number(2).unwrap(), Policy::SkewMapp);
        assert_eq!(Policy::from_number(3).unwrap(), Policy::PrimeMapp);
        assert_eq!(Policy::from_number(4).unwrap(), Policy::FirstTouch);
        assert!(Policy::from_number(5).is_err());
    }

    #[test]
    fn test_defaults_without_environment() {
        // Environment mutation is process-wide; this test only exercises the
        // fallback path for variables that are never set in test runs.
        let config = Config::from_env(0, 0).unwrap();
        assert_eq!(config.memory_size, DEFAULT_MEMORY_SIZE);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE);
        assert!(config.write_buffer_write_back_size <= config.write_buffer_size);
    }

    #[test]
    fn test_argument_overrides_environment() {
        let config = Config::from_env(1 << 24, 1 << 21).unwrap();
        assert_eq!(config.memory_size, 1 << 24);
        assert_eq!(config.cache_size, 1 << 21);
    }
}
