// src/utils/mod.rs
//! Shared utilities: configuration, errors, and host capacity probing

pub mod config;
pub mod errors;
pub mod host;

pub use config::{EvictionStrategy, PoolConfig};
pub use errors::{PoolError, Result};
pub use host::{FixedHostProbe, HostProbe, SystemHostProbe};

/// Milliseconds since the Unix epoch (wall clock)
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
