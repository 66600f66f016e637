// src/runtime/credentials.rs
//! OS credentials a worker runs under
//!
//! Credentials are resolved by the caller from workspace-directory ownership;
//! the pool only applies them. The privilege drop happens between fork and
//! exec, and only when the target ids differ from the pool's effective ids.

use nix::unistd::{getegid, geteuid};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Environment variables a worker receives alongside `--socket`
pub const ENV_SOCKET_PATH: &str = "WORKER_SOCKET_PATH";
pub const ENV_WORKSPACE_KEY: &str = "WORKER_WORKSPACE_KEY";
pub const ENV_UID: &str = "WORKER_UID";
pub const ENV_GID: &str = "WORKER_GID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub cwd: PathBuf,
    pub workspace_key: String,
}

impl WorkerCredentials {
    pub fn new(uid: u32, gid: u32, cwd: impl Into<PathBuf>, workspace_key: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            cwd: cwd.into(),
            workspace_key: workspace_key.into(),
        }
    }

    /// Credentials of the current process, for single-user hosts and tests
    pub fn current(cwd: impl Into<PathBuf>, workspace_key: impl Into<String>) -> Self {
        Self::new(
            geteuid().as_raw(),
            getegid().as_raw(),
            cwd,
            workspace_key,
        )
    }

    /// Whether spawning under these credentials changes identity
    pub fn requires_privilege_drop(&self) -> bool {
        self.uid != geteuid().as_raw() || self.gid != getegid().as_raw()
    }

    /// Apply working directory, identity, and environment to a spawn command
    pub fn apply(&self, command: &mut Command) {
        command.current_dir(&self.cwd);

        if self.requires_privilege_drop() {
            debug!(
                "Dropping privileges for {} to uid={} gid={}",
                self.workspace_key, self.uid, self.gid
            );
            command.gid(self.gid);
            command.uid(self.uid);
        }

        command
            .env(ENV_WORKSPACE_KEY, &self.workspace_key)
            .env(ENV_UID, self.uid.to_string())
            .env(ENV_GID, self.gid.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_needs_no_drop() {
        let creds = WorkerCredentials::current("/tmp", "ws");
        assert!(!creds.requires_privilege_drop());
    }

    #[test]
    fn test_foreign_uid_needs_drop() {
        let me = WorkerCredentials::current("/tmp", "ws");
        let other = WorkerCredentials::new(me.uid.wrapping_add(1), me.gid, "/tmp", "ws");
        assert!(other.requires_privilege_drop());
    }
}
