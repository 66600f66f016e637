// src/lib.rs
//! Tenant Worker Pool Library
//!
//! Runs AI agent sessions in per-tenant OS processes. Each worker process
//! serves one workspace under that tenant's credentials and handles one turn
//! at a time over a private Unix socket; the pool decides when to reuse,
//! spawn, evict, queue or reject.
//!
//! # Architecture
//!
//! The library is structured into a few modules:
//!
//! - **runtime**: Pool manager, admission, eviction, queueing, worker IPC
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration, errors, host probing
//!
//! # Example
//!
//! ```no_run
//! use tenant_worker_pool::{get_pool, QueryOptions, WorkerCredentials};
//! use serde_json::json;
//!
//! # async fn run() -> tenant_worker_pool::Result<()> {
//! let pool = get_pool(None)?;
//! let credentials = WorkerCredentials::new(1001, 1001, "/srv/sites/a", "site-a");
//! let outcome = pool
//!     .query(credentials, QueryOptions::new("req-1", "user-7", json!({ "prompt": "hi" })))
//!     .await?;
//! println!("{:?}", outcome.result);
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::credentials::WorkerCredentials;
pub use runtime::events::PoolEvent;
pub use runtime::pool_manager::{get_pool, PoolManager, PoolStats, QueryOptions, QueryOutcome};
pub use utils::config::{EvictionStrategy, PoolConfig};
pub use utils::errors::{PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
