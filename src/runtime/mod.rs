// src/runtime/mod.rs
//! Worker runtime
//!
//! This module provides the per-tenant worker pool, including:
//!
//! - **Pool Manager**: The `query` entry point, stats, shutdown and timers
//! - **Admission**: Reuse / spawn / evict / queue / reject decisions
//! - **Eviction**: Victim selection and the retirement sequence
//! - **Request Queue**: Per-workspace FIFO of waiting requests
//! - **Orphan Sweeper**: Reclaims sockets and processes nothing tracks
//! - **Process Manager**: Spawning workers under tenant credentials
//! - **IPC**: Newline-delimited JSON frames over a Unix socket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Pool Manager                        │
//! │   admission ──▶ registry ◀── eviction timer             │
//! │       │            ▲              orphan sweeper        │
//! │       ▼            │                                    │
//! │  request queue ────┘                                    │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ one Unix socket per instance
//!     ┌───────────┼───────────┬───────────┐
//!     ▼           ▼           ▼           ▼
//! ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐
//! │ site-a │ │ site-a │ │ site-b │ │ site-c │   ...
//! │  #0    │ │  #1    │ │  #0    │ │  #0    │
//! └────────┘ └────────┘ └────────┘ └────────┘
//!  worker processes, one turn at a time each
//! ```

pub mod admission;
pub mod credentials;
pub mod events;
pub mod eviction;
pub mod ipc;
pub mod orphan_sweeper;
pub mod pool_manager;
pub mod process_manager;
pub mod registry;
pub mod request_queue;
pub mod worker;

// Re-export commonly used types
pub use admission::{Admission, AdmissionController};
pub use credentials::WorkerCredentials;
pub use events::{EventBus, PoolEvent};
pub use eviction::{RetireOutcome, RetireReason};
pub use orphan_sweeper::SweepReport;
pub use pool_manager::{get_pool, PoolManager, PoolStats, QueryOptions, QueryOutcome};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use worker::{InstanceKey, WorkerRecord, WorkerState};
