// src/runtime/process_manager.rs
//! Process manager for spawning and signalling worker processes
//!
//! A worker is started as `<entry> <args...> --socket <path>` under the
//! caller's credentials. It must bind the socket and print `ready` on stdout
//! within the ready deadline; everything else it prints is forwarded to
//! `tracing` at debug level.

use crate::runtime::credentials::{WorkerCredentials, ENV_SOCKET_PATH};
use crate::utils::errors::{PoolError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::debug;

/// Line a worker prints once its socket is bound
pub const READY_LINE: &str = "ready";

/// Per-spawn parameters
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Label used in logs (the instance key)
    pub label: String,

    pub socket_path: PathBuf,

    pub credentials: WorkerCredentials,
}

/// Process manager for spawning worker processes
#[derive(Debug, Clone)]
pub struct ProcessManager {
    entry: PathBuf,
    args: Vec<String>,
}

impl ProcessManager {
    pub fn new(entry: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            entry: entry.into(),
            args,
        }
    }

    /// Spawn a worker process. Must be called inside a tokio runtime.
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        debug!("Spawning worker {} via {:?}", config.label, self.entry);

        let mut command = Command::new(&self.entry);
        command
            .args(&self.args)
            .arg("--socket")
            .arg(&config.socket_path)
            .env(ENV_SOCKET_PATH, &config.socket_path);

        config.credentials.apply(&mut command);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            PoolError::ProcessSpawnFailed(format!("Failed to spawn {:?}: {}", self.entry, e))
        })?;

        if let Some(stderr) = child.stderr.take() {
            forward_output(BufReader::new(stderr).lines(), config.label.clone());
        }

        debug!("Worker {} spawned with PID: {:?}", config.label, child.id());
        Ok(child)
    }

    /// Wait for the ready line on the child's stdout
    pub async fn await_ready(&self, child: &mut Child, label: &str, timeout: Duration) -> Result<()> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::ProcessSpawnFailed("Failed to capture stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let handshake = async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim() == READY_LINE => return Ok(()),
                    Ok(Some(line)) => debug!(worker = label, "{}", line),
                    Ok(None) => {
                        return Err(PoolError::ProcessSpawnFailed(
                            "worker exited before signalling ready".into(),
                        ))
                    }
                    Err(e) => {
                        return Err(PoolError::ProcessSpawnFailed(format!(
                            "Failed to read worker stdout: {}",
                            e
                        )))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {
                forward_output(lines, label.to_string());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::ProcessSpawnFailed(format!(
                "no ready signal within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Ask a process to exit (SIGTERM)
    pub fn terminate(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGTERM to PID {}", pid);
        signal(pid, Signal::SIGTERM)
    }

    /// Kill a process outright (SIGKILL)
    pub fn force_kill(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGKILL to PID {}", pid);
        signal(pid, Signal::SIGKILL)
    }

    /// Check if a process is running
    pub fn is_running(&self, pid: u32) -> bool {
        is_running(pid)
    }
}

/// Signal 0 probe; EPERM means the process exists under another uid
pub fn is_running(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn signal(pid: u32, sig: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(PoolError::WorkerFault(format!(
            "Failed to send {} to {}: {}",
            sig, pid, e
        ))),
    }
}

fn forward_output<R>(mut lines: Lines<BufReader<R>>, label: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker = %label, "{}", line);
        }
    });
}
