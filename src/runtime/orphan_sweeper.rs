// src/runtime/orphan_sweeper.rs
//! Orphan sweeper: reclaim sockets and processes nothing tracks any more
//!
//! A worker socket is an orphan when no live registry record points at it,
//! typically after the pool crashed or was restarted. Orphans younger than
//! `orphan_max_age_ms` are left alone because they may belong to a spawn
//! that has not registered its pid yet.
//!
//! Reaping an orphan:
//!
//! ```text
//! <dir>/<stem>.<n>.sock.pid ─▶ pid alive and still our worker? ─▶ SIGKILL
//! <dir>/<stem>.<n>.sock     ─▶ unlink
//! <dir>/<stem>.<n>.sock.pid ─▶ unlink
//! ```
//!
//! The pid file holds `<pid> <start time>`, the start time being field 22 of
//! `/proc/<pid>/stat`. A pid whose start time no longer matches was recycled
//! and is never signalled. Pid files without a start time fall back to
//! checking that the process command line names the socket.
//!
//! Everything here is blocking filesystem work; the pool runs it on the
//! blocking thread pool.

use crate::runtime::process_manager::is_running;
use crate::runtime::worker::{parse_socket_name, pid_path};
use crate::utils::errors::{PoolError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Orphan sockets (and their pid files) removed
    pub sockets_reaped: usize,
    /// Orphan processes that were still running and got SIGKILL
    pub processes_killed: usize,
    /// Registry entries dropped because their process had died
    pub records_removed: usize,
    /// Orphans left alone because they were too young
    pub skipped_young: usize,
    /// Reap attempts that failed; retried next cycle
    pub failures: usize,
}

impl SweepReport {
    /// Everything counted towards `orphans_reaped`
    pub fn reaped(&self) -> usize {
        self.sockets_reaped + self.records_removed
    }
}

/// Contents of a worker pid file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidFile {
    pub pid: u32,
    /// Kernel start time in clock ticks since boot, when it could be read
    pub start_time: Option<u64>,
}

/// An untracked socket old enough to reap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanSocket {
    pub socket_path: PathBuf,
    pub pid: Option<PidFile>,
    pub age: Duration,
}

#[derive(Debug, Default)]
pub struct SocketScan {
    pub orphans: Vec<OrphanSocket>,
    pub young: usize,
}

/// Find sockets (or pid files left without a socket) in `dir` that no live
/// record claims. A missing directory is an empty scan.
pub fn scan_sockets(
    dir: &Path,
    live: &HashSet<PathBuf>,
    now: SystemTime,
    max_age: Duration,
) -> Result<SocketScan> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SocketScan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut candidates = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let socket_name = name.strip_suffix(".pid").unwrap_or(&name);
        if parse_socket_name(socket_name).is_some() {
            candidates.insert(dir.join(socket_name));
        }
    }

    let mut scan = SocketScan::default();
    for socket_path in candidates {
        if live.contains(&socket_path) {
            continue;
        }

        let Some(age) = file_age(&socket_path, now).or_else(|| file_age(&pid_path(&socket_path), now))
        else {
            continue;
        };
        if age < max_age {
            scan.young += 1;
            continue;
        }

        scan.orphans.push(OrphanSocket {
            pid: read_pid_file(&socket_path),
            socket_path,
            age,
        });
    }
    Ok(scan)
}

/// Kill the orphan's process if it is still alive and still the worker that
/// owned the socket, then unlink its files. Returns whether a process was
/// killed.
pub fn reap_socket(orphan: &OrphanSocket) -> Result<bool> {
    let mut killed = false;
    if let Some(recorded) = orphan.pid.filter(|recorded| is_running(recorded.pid)) {
        let pid = recorded.pid;
        if is_worker_process(&recorded, &orphan.socket_path) {
            info!(
                "Killing orphan worker pid {} ({:?})",
                pid, orphan.socket_path
            );
            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => killed = true,
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    return Err(PoolError::WorkerFault(format!(
                        "Failed to kill orphan pid {}: {}",
                        pid, e
                    )))
                }
            }
        } else {
            warn!(
                "Pid {} no longer belongs to the worker on {:?}, leaving it running",
                pid, orphan.socket_path
            );
        }
    }

    remove_worker_files(&orphan.socket_path)?;
    debug!(
        "Reaped orphan socket {:?} (age {}ms)",
        orphan.socket_path,
        orphan.age.as_millis()
    );
    Ok(killed)
}

/// Whether the process behind `recorded` is still the worker serving
/// `socket_path`
pub fn is_worker_process(recorded: &PidFile, socket_path: &Path) -> bool {
    match (recorded.start_time, process_start_time(recorded.pid)) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => command_line_names(recorded.pid, socket_path),
    }
}

/// Start time of `pid` in clock ticks since boot (`/proc/<pid>/stat` field 22)
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses; fields resume
    // after the last `)` starting with field 3
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(19)?.parse().ok()
}

fn command_line_names(pid: u32, socket_path: &Path) -> bool {
    let Ok(cmdline) = fs::read(format!("/proc/{}/cmdline", pid)) else {
        return false;
    };
    let socket = socket_path.as_os_str().as_bytes();
    cmdline.split(|b| *b == 0).any(|arg| arg == socket)
}

/// Record the pid of a freshly spawned worker next to its socket
pub fn write_pid_file(socket_path: &Path, pid: u32) -> Result<()> {
    let contents = match process_start_time(pid) {
        Some(start_time) => format!("{} {}\n", pid, start_time),
        None => format!("{}\n", pid),
    };
    fs::write(pid_path(socket_path), contents)?;
    Ok(())
}

pub fn read_pid_file(socket_path: &Path) -> Option<PidFile> {
    let contents = fs::read_to_string(pid_path(socket_path)).ok()?;
    let mut fields = contents.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let start_time = fields.next().and_then(|field| field.parse().ok());
    Some(PidFile { pid, start_time })
}

/// Unlink a worker's socket and pid file; files already gone are fine
pub fn remove_worker_files(socket_path: &Path) -> Result<()> {
    for path in [socket_path.to_path_buf(), pid_path(socket_path)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn file_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = fs::symlink_metadata(path).ok()?.modified().ok()?;
    Some(now.duration_since(modified).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let scan = scan_sockets(
            Path::new("/nonexistent/worker-pool"),
            &HashSet::new(),
            SystemTime::now(),
            Duration::ZERO,
        )
        .unwrap();
        assert!(scan.orphans.is_empty());
        assert_eq!(scan.young, 0);
    }

    #[test]
    fn test_live_and_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let live_socket = dir.path().join("ws.0.sock");
        touch(&live_socket);
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("ws.sock"));

        let live: HashSet<PathBuf> = [live_socket].into_iter().collect();
        let scan = scan_sockets(dir.path(), &live, SystemTime::now() + HOUR, Duration::ZERO).unwrap();
        assert!(scan.orphans.is_empty());
    }

    #[test]
    fn test_young_orphans_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("ws.0.sock"));

        let scan = scan_sockets(dir.path(), &HashSet::new(), SystemTime::now(), HOUR).unwrap();
        assert!(scan.orphans.is_empty());
        assert_eq!(scan.young, 1);
    }

    #[test]
    fn test_old_orphan_is_reaped_with_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.1.sock");
        touch(&socket);
        // pid_max is far below this on Linux, so nothing gets signalled
        write_pid_file(&socket, i32::MAX as u32 - 1).unwrap();

        let scan = scan_sockets(dir.path(), &HashSet::new(), SystemTime::now() + HOUR, HOUR / 2).unwrap();
        assert_eq!(scan.orphans.len(), 1);
        let orphan = &scan.orphans[0];
        assert_eq!(orphan.socket_path, socket);
        assert_eq!(orphan.pid.map(|recorded| recorded.pid), Some(i32::MAX as u32 - 1));

        assert!(!reap_socket(orphan).unwrap());
        assert!(!socket.exists());
        assert!(!pid_path(&socket).exists());
    }

    #[test]
    fn test_pid_file_without_socket_is_an_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.2.sock");
        write_pid_file(&socket, i32::MAX as u32 - 1).unwrap();

        let scan = scan_sockets(dir.path(), &HashSet::new(), SystemTime::now() + HOUR, Duration::ZERO).unwrap();
        assert_eq!(scan.orphans.len(), 1);
        assert_eq!(scan.orphans[0].socket_path, socket);
    }

    fn spawn_sleeper() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn orphan_at(socket: &Path) -> OrphanSocket {
        OrphanSocket {
            socket_path: socket.to_path_buf(),
            pid: read_pid_file(socket),
            age: HOUR,
        }
    }

    #[test]
    fn test_pid_file_records_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.0.sock");
        let pid = std::process::id();
        write_pid_file(&socket, pid).unwrap();

        let recorded = read_pid_file(&socket).unwrap();
        assert_eq!(recorded.pid, pid);
        assert_eq!(recorded.start_time, process_start_time(pid));
        assert!(recorded.start_time.is_some());
        assert!(is_worker_process(&recorded, &socket));
    }

    #[test]
    fn test_plain_pid_file_still_parses() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.0.sock");
        fs::write(pid_path(&socket), "4242\n").unwrap();
        assert_eq!(
            read_pid_file(&socket),
            Some(PidFile {
                pid: 4242,
                start_time: None
            })
        );
    }

    #[test]
    fn test_recorded_worker_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.3.sock");
        touch(&socket);
        let mut child = spawn_sleeper();
        write_pid_file(&socket, child.id()).unwrap();

        assert!(reap_socket(&orphan_at(&socket)).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!socket.exists());
    }

    #[test]
    fn test_recycled_pid_is_not_killed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.4.sock");
        touch(&socket);
        let mut bystander = spawn_sleeper();
        // Same pid, but a start time the live process does not have
        fs::write(pid_path(&socket), format!("{} 1\n", bystander.id())).unwrap();

        assert!(!reap_socket(&orphan_at(&socket)).unwrap());
        assert!(bystander.try_wait().unwrap().is_none());
        assert!(!socket.exists());
        assert!(!pid_path(&socket).exists());

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[test]
    fn test_plain_pid_file_needs_matching_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ws.5.sock");
        let mut bystander = spawn_sleeper();
        fs::write(pid_path(&socket), format!("{}\n", bystander.id())).unwrap();

        assert!(!reap_socket(&orphan_at(&socket)).unwrap());
        assert!(bystander.try_wait().unwrap().is_none());
        bystander.kill().unwrap();
        bystander.wait().unwrap();

        // A process started with the socket on its command line matches
        let mut worker = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30; exit 0")
            .arg("sh")
            .arg(&socket)
            .spawn()
            .unwrap();
        let recorded = PidFile {
            pid: worker.id(),
            start_time: None,
        };
        assert!(is_worker_process(&recorded, &socket));
        worker.kill().unwrap();
        worker.wait().unwrap();
    }

    #[test]
    fn test_remove_worker_files_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_worker_files(&dir.path().join("gone.0.sock")).unwrap();
    }

    #[test]
    fn test_report_totals() {
        let report = SweepReport {
            sockets_reaped: 2,
            records_removed: 1,
            ..Default::default()
        };
        assert_eq!(report.reaped(), 3);
    }
}
