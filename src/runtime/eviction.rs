// src/runtime/eviction.rs
//! Eviction engine
//!
//! Picks which idle worker to retire when capacity is needed, finds workers
//! that have outlived the inactivity or age limits, and runs the retirement
//! sequence against the process:
//!
//! ```text
//! draining ─▶ shutdown frame (or SIGTERM) ─▶ wait shutdown_timeout
//!                                              │ no exit
//!                                              ▼
//!                                  SIGKILL ─▶ wait kill_grace ─▶ dead
//! ```

use crate::runtime::ipc::{Connection, PoolFrame};
use crate::runtime::process_manager::ProcessManager;
use crate::runtime::worker::{InstanceKey, WorkerRecord, WorkerState};
use crate::utils::config::EvictionStrategy;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Why a worker is being retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Idle longer than `inactivity_timeout_ms`
    Inactivity,
    /// Older than `max_age_ms`
    MaxAge,
    /// Chosen as victim to free capacity
    Evicted,
    Shutdown,
    /// Socket error or unexpected exit
    Fault,
    /// Cancel not acknowledged in time
    CancelTimeout,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::Inactivity => "inactivity",
            RetireReason::MaxAge => "max_age",
            RetireReason::Evicted => "evicted",
            RetireReason::Shutdown => "shutdown",
            RetireReason::Fault => "fault",
            RetireReason::CancelTimeout => "cancel_timeout",
        }
    }
}

/// Pick the victim among idle workers. Busy workers are never candidates.
///
/// Ties fall back to spawn time, then instance key, so the choice does not
/// depend on registry iteration order.
pub fn select_victim<'a, I>(strategy: EvictionStrategy, candidates: I) -> Option<&'a WorkerRecord>
where
    I: IntoIterator<Item = &'a WorkerRecord>,
{
    candidates
        .into_iter()
        .filter(|record| record.state == WorkerState::Idle)
        .min_by(|a, b| compare(strategy, a, b))
}

fn compare(strategy: EvictionStrategy, a: &WorkerRecord, b: &WorkerRecord) -> Ordering {
    let primary = match strategy {
        EvictionStrategy::Lru => a.last_active_at_ms.cmp(&b.last_active_at_ms),
        EvictionStrategy::Oldest => a.spawned_at_ms.cmp(&b.spawned_at_ms),
        EvictionStrategy::LeastUsed => a.requests_served.cmp(&b.requests_served),
    };
    primary
        .then_with(|| a.spawned_at_ms.cmp(&b.spawned_at_ms))
        .then_with(|| a.instance_key.cmp(&b.instance_key))
}

/// Idle workers past the inactivity or age limit. A limit of 0 is disabled.
pub fn stale_workers<'a, I>(
    records: I,
    now_ms: u64,
    inactivity_timeout_ms: u64,
    max_age_ms: u64,
) -> Vec<(InstanceKey, RetireReason)>
where
    I: IntoIterator<Item = &'a WorkerRecord>,
{
    let mut stale: Vec<(InstanceKey, RetireReason)> = records
        .into_iter()
        .filter(|record| record.state == WorkerState::Idle)
        .filter_map(|record| {
            if inactivity_timeout_ms > 0 && record.idle_for_ms(now_ms) > inactivity_timeout_ms {
                Some((record.instance_key.clone(), RetireReason::Inactivity))
            } else if max_age_ms > 0 && record.age_ms(now_ms) > max_age_ms {
                Some((record.instance_key.clone(), RetireReason::MaxAge))
            } else {
                None
            }
        })
        .collect();
    stale.sort_by(|a, b| a.0.cmp(&b.0));
    stale
}

/// Everything needed to retire a worker after it has been marked draining
#[derive(Debug)]
pub struct RetireTicket {
    pub key: InstanceKey,
    /// Registry generation the ticket was issued for
    pub generation: u64,
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub exited: Option<watch::Receiver<bool>>,
    pub reason: RetireReason,
}

/// How the process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    /// Exited after the graceful signal (or was never started)
    Exited,
    /// Needed SIGKILL
    Killed,
    /// Still present after SIGKILL and the grace period
    Unresponsive,
}

/// Run the shutdown sequence against a worker process
pub async fn retire_process(
    processes: &ProcessManager,
    ticket: &mut RetireTicket,
    shutdown_timeout: Duration,
    kill_grace: Duration,
) -> RetireOutcome {
    let (Some(pid), Some(exited)) = (ticket.pid, ticket.exited.as_mut()) else {
        return RetireOutcome::Exited;
    };

    if *exited.borrow() {
        return RetireOutcome::Exited;
    }

    debug!("Retiring worker {} (pid {}, {})", ticket.key, pid, ticket.reason.as_str());
    if let Err(e) = send_shutdown(&ticket.socket_path, shutdown_timeout).await {
        debug!("Shutdown frame to {} not delivered ({}), sending SIGTERM", ticket.key, e);
        if let Err(e) = processes.terminate(pid) {
            warn!("Failed to signal worker {}: {}", ticket.key, e);
        }
    }

    if wait_for_exit(exited, shutdown_timeout).await {
        return RetireOutcome::Exited;
    }

    warn!(
        "Worker {} did not exit within {}ms, killing",
        ticket.key,
        shutdown_timeout.as_millis()
    );
    if let Err(e) = processes.force_kill(pid) {
        warn!("Failed to kill worker {}: {}", ticket.key, e);
    }

    if wait_for_exit(exited, kill_grace).await {
        RetireOutcome::Killed
    } else {
        RetireOutcome::Unresponsive
    }
}

async fn send_shutdown(socket_path: &std::path::Path, timeout: Duration) -> crate::Result<()> {
    let mut connection = Connection::connect(socket_path, timeout).await?;
    connection.send(&PoolFrame::Shutdown).await
}

/// A dropped sender means the exit watcher is gone, which only happens
/// after the process was reaped.
async fn wait_for_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn idle(workspace: &str, spawned: u64, active: u64, served: u64) -> WorkerRecord {
        let mut record = WorkerRecord::new(
            InstanceKey::new(workspace, 0),
            PathBuf::from(format!("/tmp/{}.sock", workspace)),
            spawned,
        );
        record.transition(WorkerState::Ready).unwrap();
        record.transition(WorkerState::Idle).unwrap();
        record.last_active_at_ms = active;
        record.requests_served = served;
        record
    }

    fn three() -> Vec<WorkerRecord> {
        vec![
            // oldest spawn, most used, middle activity
            idle("a", 100, 500, 9),
            // newest spawn, least recently active
            idle("b", 300, 350, 4),
            // middle spawn, least used, most recently active
            idle("c", 200, 900, 1),
        ]
    }

    #[test]
    fn test_each_strategy_picks_its_victim() {
        let records = three();
        let pick = |s| select_victim(s, &records).unwrap().workspace_key.clone();
        assert_eq!(pick(EvictionStrategy::Lru), "b");
        assert_eq!(pick(EvictionStrategy::Oldest), "a");
        assert_eq!(pick(EvictionStrategy::LeastUsed), "c");
    }

    #[test]
    fn test_least_used_tie_breaks_on_spawn_time() {
        let records = vec![idle("late", 500, 0, 2), idle("early", 100, 0, 2)];
        let victim = select_victim(EvictionStrategy::LeastUsed, &records).unwrap();
        assert_eq!(victim.workspace_key, "early");
    }

    #[test]
    fn test_busy_workers_never_chosen() {
        let mut records = three();
        for record in records.iter_mut() {
            record.transition(WorkerState::Busy).unwrap();
        }
        assert!(select_victim(EvictionStrategy::Lru, &records).is_none());
    }

    #[test]
    fn test_stale_sweep() {
        let records = vec![
            idle("fresh", 9_000, 9_500, 0),
            idle("inactive", 8_000, 1_000, 0),
            idle("ancient", 0, 9_900, 0),
        ];

        let stale = stale_workers(&records, 10_000, 5_000, 9_000);
        assert_eq!(
            stale,
            vec![
                (InstanceKey::new("ancient", 0), RetireReason::MaxAge),
                (InstanceKey::new("inactive", 0), RetireReason::Inactivity),
            ]
        );
    }

    #[test]
    fn test_stale_sweep_disabled_by_zero() {
        let records = vec![idle("old", 0, 0, 0)];
        assert!(stale_workers(&records, 1_000_000, 0, 0).is_empty());
        assert_eq!(stale_workers(&records, 1_000_000, 0, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_retire_without_process_is_immediate() {
        let processes = ProcessManager::new("/bin/true", vec![]);
        let mut ticket = RetireTicket {
            key: InstanceKey::new("ws", 0),
            generation: 0,
            pid: None,
            socket_path: PathBuf::from("/nonexistent.sock"),
            exited: None,
            reason: RetireReason::Shutdown,
        };
        let outcome = retire_process(
            &processes,
            &mut ticket,
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome, RetireOutcome::Exited);
    }

    proptest! {
        #[test]
        fn prop_victim_independent_of_order(
            rotation in 0usize..3,
            reverse in any::<bool>(),
            strategy in proptest::sample::select(EvictionStrategy::ALL.to_vec()),
        ) {
            let mut records = three();
            records.rotate_left(rotation);
            if reverse {
                records.reverse();
            }
            let baseline = three();
            let expected = select_victim(strategy, &baseline).unwrap().instance_key.clone();
            let actual = select_victim(strategy, &records).unwrap().instance_key.clone();
            prop_assert_eq!(actual, expected);
        }
    }
}
