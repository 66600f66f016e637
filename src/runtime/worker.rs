// src/runtime/worker.rs
//! Worker identity, lifecycle state, and registry record
//!
//! ```text
//! spawning ──ready──▶ ready ──dispatch──▶ busy ◀──dispatch── idle
//!    │                  │                  │ ──completion──▶  │
//!    │                  └──────────────────┴───────┬──────────┘
//!    │                                             ▼
//!    └──────────────(no ready signal)──▶ dead ◀── draining
//! ```

use crate::utils::errors::{PoolError, Result};
use fnv::FnvHasher;
use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

/// Longest workspace fragment kept in a socket file name
const MAX_SOCKET_STEM: usize = 64;

/// One worker instance of a workspace: `workspace:index`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    workspace: String,
    index: u32,
}

impl InstanceKey {
    pub fn new(workspace: impl Into<String>, index: u32) -> Self {
        Self {
            workspace: workspace.into(),
            index,
        }
    }

    /// Base workspace key with the instance suffix stripped
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workspace, self.index)
    }
}

impl Serialize for InstanceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Idle,
    Draining,
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Idle => "idle",
            WorkerState::Draining => "draining",
            WorkerState::Dead => "dead",
        }
    }

    /// Allowed edges. Busy and idle alternate; nothing leads back to
    /// spawning or ready, and draining only ends in dead.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Spawning, Ready)
                | (Spawning, Draining)
                | (Spawning, Dead)
                | (Ready, Busy)
                | (Ready, Idle)
                | (Ready, Draining)
                | (Busy, Idle)
                | (Busy, Draining)
                | (Idle, Busy)
                | (Idle, Draining)
                | (Draining, Dead)
        )
    }

    /// Counts against capacity (draining workers are on their way out)
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkerState::Draining | WorkerState::Dead)
    }

    /// Available for a new dispatch
    pub fn is_available(&self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Idle)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry record for one worker process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub instance_key: InstanceKey,
    pub workspace_key: String,
    /// Unknown until the process has been created
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub state: WorkerState,
    pub spawned_at_ms: u64,
    pub last_active_at_ms: u64,
    pub requests_served: u64,
    pub current_request_id: Option<String>,
}

impl WorkerRecord {
    pub fn new(instance_key: InstanceKey, socket_path: PathBuf, now_ms: u64) -> Self {
        Self {
            workspace_key: instance_key.workspace().to_string(),
            instance_key,
            pid: None,
            socket_path,
            state: WorkerState::Spawning,
            spawned_at_ms: now_ms,
            last_active_at_ms: now_ms,
            requests_served: 0,
            current_request_id: None,
        }
    }

    pub fn transition(&mut self, next: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PoolError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn idle_for_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_active_at_ms)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.spawned_at_ms)
    }
}

/// Deterministic socket path for an instance.
///
/// The workspace key is reduced to `[A-Za-z0-9_-]`, so dots become `_` as
/// well. When that changes or truncates the key, a hash of the original is
/// appended so distinct keys never share a socket.
pub fn socket_path(socket_dir: &Path, key: &InstanceKey) -> PathBuf {
    socket_dir.join(format!("{}.{}.sock", socket_stem(key.workspace()), key.index()))
}

/// Pid file written beside a worker socket
pub fn pid_path(socket_path: &Path) -> PathBuf {
    let mut name = socket_path.as_os_str().to_owned();
    name.push(".pid");
    PathBuf::from(name)
}

/// Filesystem-safe fragment for a workspace key
pub fn socket_stem(workspace: &str) -> String {
    let mut safe: String = workspace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let truncated = safe.len() > MAX_SOCKET_STEM;
    if truncated {
        safe.truncate(MAX_SOCKET_STEM);
    }
    if truncated || safe != workspace || safe.is_empty() {
        safe.push('-');
        safe.push_str(&format!("{:016x}", fnv1a(workspace.as_bytes())));
    }
    safe
}

/// Split a socket file name back into `(stem, instance index)`
pub fn parse_socket_name(file_name: &str) -> Option<(&str, u32)> {
    let rest = file_name.strip_suffix(".sock")?;
    let (stem, index) = rest.rsplit_once('.')?;
    Some((stem, index.parse().ok()?))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}
