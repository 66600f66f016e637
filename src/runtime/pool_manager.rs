// src/runtime/pool_manager.rs
//! Pool manager: per-tenant worker processes behind one `query` call
//!
//! # Architecture
//!
//! ```text
//! query(credentials, options)
//!   │
//!   ├─ admit ────────── lock ─▶ AdmissionController::decide
//!   │                           ├─ reuse  → mark busy
//!   │                           ├─ spawn  → reserve `spawning` record
//!   │                           ├─ evict  → drain victim + reserve
//!   │                           ├─ queue  → RequestQueue::push
//!   │                           └─ reject → PoolSaturated
//!   │
//!   └─ serve (own task)
//!        ├─ wait in queue (if queued)
//!        ├─ spawn + ready handshake (if reserved)
//!        └─ dispatch over the worker socket, stream messages
//! ```
//!
//! All registry and queue mutation happens synchronously under one
//! `parking_lot` mutex that is never held across an await, so reservations
//! are made before the first suspension point. Lifecycle events are
//! published under the same lock, which keeps each worker's events in order.
//!
//! Dropping a `query` future cancels the request exactly as if its
//! cancellation token had fired.

use crate::observability::{
    ORPHANS_REAPED, QUEUE_DEPTH, REQUESTS_ADMITTED, REQUESTS_REJECTED, SPAWN_FAILURES,
    WORKERS_BUSY, WORKERS_IDLE, WORKERS_RETIRED, WORKERS_SPAWNED, WORKERS_TOTAL,
};
use crate::runtime::admission::{Admission, AdmissionController, AdmissionRequest};
use crate::runtime::credentials::WorkerCredentials;
use crate::runtime::events::{EventBus, PoolEvent};
use crate::runtime::eviction::{
    retire_process, stale_workers, RetireOutcome, RetireReason, RetireTicket,
};
use crate::runtime::ipc::{Connection, PoolFrame, WorkerFrame};
use crate::runtime::orphan_sweeper::{self, OrphanSocket, SweepReport};
use crate::runtime::process_manager::{is_running, ProcessManager, SpawnConfig};
use crate::runtime::registry::WorkerRegistry;
use crate::runtime::request_queue::{Assignment, QueueEntry, RequestQueue};
use crate::runtime::worker::{socket_path, InstanceKey, WorkerRecord, WorkerState};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use crate::utils::host::{HostProbe, SystemHostProbe};
use crate::utils::now_ms;
use futures::future::join_all;
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Workload class used when the caller does not set one
pub const DEFAULT_WORKLOAD_CLASS: &str = "interactive";

static POOL: OnceCell<PoolManager> = OnceCell::new();

/// Process-wide pool.
///
/// The first call builds the pool from `config` (or the defaults). Later
/// calls return the same instance; a config passed to a later call is
/// ignored with a warning, since the configuration is fixed at construction.
pub fn get_pool(config: Option<PoolConfig>) -> Result<&'static PoolManager> {
    let mut supplied = config;
    let pool = POOL.get_or_try_init(|| PoolManager::new(supplied.take().unwrap_or_default()))?;
    if supplied.is_some() {
        warn!("Worker pool already initialized; ignoring the new configuration");
    }
    Ok(pool)
}

/// Request envelope for [`PoolManager::query`]
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Globally unique request id
    pub request_id: String,

    /// Accountable end user, for fairness accounting
    pub owner_key: String,

    /// Free-form traffic tag (`interactive`, `scheduled`, ...)
    pub workload_class: String,

    /// Agent payload, passed to the worker untouched
    pub payload: Value,

    /// Receives every streamed message in order
    pub on_message: Option<mpsc::Sender<Value>>,

    /// Cancelling this token cancels the request
    pub cancel: CancellationToken,
}

impl QueryOptions {
    pub fn new(request_id: impl Into<String>, owner_key: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            owner_key: owner_key.into(),
            workload_class: DEFAULT_WORKLOAD_CLASS.to_string(),
            payload,
            on_message: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn workload_class(mut self, class: impl Into<String>) -> Self {
        self.workload_class = class.into();
        self
    }

    pub fn on_message(mut self, sink: mpsc::Sender<Value>) -> Self {
        self.on_message = Some(sink);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Settled result of a completed turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub request_id: String,
    pub instance_key: InstanceKey,
    /// Final result carried by the worker's `complete` frame
    pub result: Option<Value>,
    /// Number of streamed messages
    pub messages: u64,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_workers: usize,
    /// Busy workers
    pub active_workers: usize,
    /// Ready or idle workers
    pub idle_workers: usize,
    pub max_workers: usize,
    pub dynamic_max_workers: usize,
    pub retired_after_cancel: u64,
    pub orphans_reaped: u64,
    pub queued_requests: usize,
}

/// Outcome of admission for one request
enum Admitted {
    Now(Assignment),
    Queued(oneshot::Receiver<Assignment>),
}

#[derive(Default)]
struct PoolState {
    registry: WorkerRegistry,
    queue: RequestQueue,
    retired_after_cancel: u64,
    orphans_reaped: u64,
    shutting_down: bool,
}

/// A background loop that stops when dropped
struct Periodic {
    stop: CancellationToken,
}

impl Periodic {
    fn start<F, Fut>(period: Duration, pool: Weak<PoolInner>, tick: F) -> Self
    where
        F: Fn(Arc<PoolInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        tick(pool).await;
                    }
                }
            }
        });
        Self { stop }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Default)]
struct Timers {
    eviction: Option<Periodic>,
    orphan_sweep: Option<Periodic>,
}

struct PoolInner {
    config: Arc<PoolConfig>,
    admission: AdmissionController,
    processes: ProcessManager,
    events: EventBus,
    state: Mutex<PoolState>,
    timers: Mutex<Timers>,
}

/// Worker pool handle; clones share the same pool
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    /// Build a pool reading capacity from the live host
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_host_probe(config, Arc::new(SystemHostProbe))
    }

    /// Build a pool from untyped overrides on top of the defaults
    pub fn from_value(overrides: &Value) -> Result<Self> {
        Self::new(PoolConfig::from_value(overrides)?)
    }

    pub fn with_host_probe(config: PoolConfig, host: Arc<dyn HostProbe>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        info!(
            "Initializing worker pool (max {} workers, {} eviction, sockets in {:?})",
            config.max_workers, config.eviction_strategy, config.socket_dir
        );

        let inner = PoolInner {
            admission: AdmissionController::new(Arc::clone(&config), host),
            processes: ProcessManager::new(
                config.worker_entry_path.clone(),
                config.worker_args.clone(),
            ),
            events: EventBus::new(),
            state: Mutex::new(PoolState::default()),
            timers: Mutex::new(Timers::default()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Run one agent turn on a worker for `credentials.workspace_key`
    pub async fn query(
        &self,
        credentials: WorkerCredentials,
        options: QueryOptions,
    ) -> Result<QueryOutcome> {
        if options.owner_key.trim().is_empty() {
            return Err(PoolError::InvalidRequest("ownerKey is required".into()));
        }
        if options.request_id.trim().is_empty() {
            return Err(PoolError::InvalidRequest("requestId is required".into()));
        }
        if credentials.workspace_key.trim().is_empty() {
            return Err(PoolError::InvalidRequest("workspaceKey is required".into()));
        }
        if options.cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let admitted = self.inner.admit(&credentials.workspace_key, &options)?;

        let mut options = options;
        options.cancel = options.cancel.child_token();
        let guard = options.cancel.clone().drop_guard();

        let task = tokio::spawn(Arc::clone(&self.inner).serve(admitted, credentials, options));
        let outcome = task
            .await
            .map_err(|e| PoolError::WorkerFault(format!("Request task failed: {}", e)));
        guard.disarm();
        outcome?
    }

    /// Snapshot of every worker record, ordered by instance key
    pub fn get_worker_info(&self) -> Vec<WorkerRecord> {
        self.inner.state.lock().registry.snapshot()
    }

    pub fn get_stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Fresh event receiver; every subscriber sees every event
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Retire every instance of a workspace. Returns how many were retired.
    pub async fn shutdown_worker(&self, workspace_key: &str) -> usize {
        let tickets = self.inner.begin_retire_workspace(workspace_key);
        self.inner.retire_all(tickets).await
    }

    /// Reject everything queued and retire every worker. New requests are
    /// refused until the call returns.
    pub async fn shutdown_all(&self) -> usize {
        let tickets = self.inner.begin_shutdown();
        let retired = self.inner.retire_all(tickets).await;
        self.inner.state.lock().shutting_down = false;
        info!("Worker pool shut down ({} workers retired)", retired);
        retired
    }

    /// One pass of the inactivity/age sweep, followed by a re-check of the
    /// queue. Returns how many were retired.
    pub async fn run_eviction_cycle(&self) -> usize {
        self.inner.run_eviction_cycle().await
    }

    /// One orphan sweep
    pub async fn sweep_orphans(&self) -> SweepReport {
        self.inner.sweep_orphans().await
    }

    pub fn start_eviction_timer(&self) {
        let mut timers = self.inner.timers.lock();
        if timers.eviction.is_some() {
            debug!("Eviction timer already running");
            return;
        }
        info!(
            "Starting eviction timer every {}ms",
            self.inner.config.eviction_interval_ms
        );
        timers.eviction = Some(Periodic::start(
            self.inner.config.eviction_interval(),
            Arc::downgrade(&self.inner),
            |pool| async move {
                pool.run_eviction_cycle().await;
            },
        ));
    }

    pub fn stop_eviction_timer(&self) {
        if self.inner.timers.lock().eviction.take().is_some() {
            info!("Stopped eviction timer");
        }
    }

    pub fn eviction_timer_running(&self) -> bool {
        self.inner.timers.lock().eviction.is_some()
    }

    pub fn start_orphan_sweeper(&self) {
        let mut timers = self.inner.timers.lock();
        if timers.orphan_sweep.is_some() {
            debug!("Orphan sweeper already running");
            return;
        }
        info!(
            "Starting orphan sweeper every {}ms",
            self.inner.config.orphan_sweep_interval_ms
        );
        timers.orphan_sweep = Some(Periodic::start(
            self.inner.config.orphan_sweep_interval(),
            Arc::downgrade(&self.inner),
            |pool| async move {
                pool.sweep_orphans().await;
            },
        ));
    }

    pub fn stop_orphan_sweeper(&self) {
        if self.inner.timers.lock().orphan_sweep.take().is_some() {
            info!("Stopped orphan sweeper");
        }
    }

    pub fn orphan_sweeper_running(&self) -> bool {
        self.inner.timers.lock().orphan_sweep.is_some()
    }
}

impl PoolInner {
    // ---- admission ----

    fn admit(self: &Arc<Self>, workspace_key: &str, options: &QueryOptions) -> Result<Admitted> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        let request = AdmissionRequest {
            owner_key: &options.owner_key,
            workspace_key,
        };
        let decision = self.admission.decide(request, &state.registry, &state.queue);

        let admitted = match decision {
            Admission::Reject(reason) => {
                counter!(REQUESTS_REJECTED).increment(1);
                debug!(
                    "Rejecting request {} for {}: {}",
                    options.request_id, workspace_key, reason
                );
                return Err(PoolError::PoolSaturated(reason));
            }
            Admission::Queue => {
                counter!(REQUESTS_ADMITTED, "decision" => "queue").increment(1);
                let (entry, receiver) = QueueEntry::new(
                    options.request_id.as_str(),
                    options.owner_key.as_str(),
                    workspace_key,
                    options.workload_class.as_str(),
                    now_ms(),
                );
                state.queue.push(entry);
                debug!(
                    "Queued request {} for {} ({} waiting)",
                    options.request_id,
                    workspace_key,
                    state.queue.queued_for_workspace(workspace_key)
                );
                Admitted::Queued(receiver)
            }
            slot => {
                counter!(REQUESTS_ADMITTED, "decision" => slot.as_str()).increment(1);
                let assignment =
                    self.apply_slot(&mut state, slot, &options.request_id, &options.owner_key)?;
                Admitted::Now(assignment)
            }
        };

        self.update_gauges(&state);
        Ok(admitted)
    }

    /// Turn a slot decision into a reservation
    fn apply_slot(
        self: &Arc<Self>,
        state: &mut PoolState,
        decision: Admission,
        request_id: &str,
        owner_key: &str,
    ) -> Result<Assignment> {
        match decision {
            Admission::Reuse(key) => {
                self.mark_busy(state, &key, request_id, owner_key)?;
                Ok(Assignment::Reuse(key))
            }
            Admission::Spawn(key) => {
                let generation = self.reserve_spawn(state, &key, owner_key)?;
                Ok(Assignment::Spawn { key, generation })
            }
            Admission::EvictAndSpawn { victim, key } => {
                if let Some(ticket) = self.begin_retire(state, &victim, RetireReason::Evicted) {
                    self.spawn_retire(ticket);
                }
                let generation = self.reserve_spawn(state, &key, owner_key)?;
                Ok(Assignment::Spawn { key, generation })
            }
            Admission::Queue | Admission::Reject(_) => Err(PoolError::PoolSaturated(
                "no worker slot available".into(),
            )),
        }
    }

    fn reserve_spawn(&self, state: &mut PoolState, key: &InstanceKey, owner_key: &str) -> Result<u64> {
        let path = socket_path(&self.config.socket_dir, key);
        state
            .registry
            .insert_spawning(key.clone(), path, owner_key, now_ms())
    }

    fn mark_busy(
        &self,
        state: &mut PoolState,
        key: &InstanceKey,
        request_id: &str,
        owner_key: &str,
    ) -> Result<()> {
        let entry = state
            .registry
            .get_mut(key)
            .ok_or_else(|| PoolError::WorkerFault(format!("Worker {} is no longer registered", key)))?;
        entry.record.transition(WorkerState::Busy)?;
        entry.record.current_request_id = Some(request_id.to_string());
        entry.record.last_active_at_ms = now_ms();
        entry.owner_key = Some(owner_key.to_string());

        self.events.publish(PoolEvent::WorkerBusy {
            workspace_key: key.workspace().to_string(),
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    /// Hand back a reservation nobody is going to use
    fn release(&self, state: &mut PoolState, assignment: Assignment) {
        match assignment {
            Assignment::Reuse(key) => {
                let Some(entry) = state.registry.get_mut(&key) else {
                    return;
                };
                entry.record.current_request_id = None;
                if entry.record.transition(WorkerState::Idle).is_ok() {
                    entry.owner_key = None;
                    self.events.publish(PoolEvent::WorkerIdle {
                        workspace_key: key.workspace().to_string(),
                    });
                }
            }
            Assignment::Spawn { key, generation } => {
                let unused = state
                    .registry
                    .get_generation_mut(&key, generation)
                    .is_some_and(|entry| entry.record.state == WorkerState::Spawning);
                if unused {
                    state.registry.remove(&key);
                }
            }
            Assignment::Rejected(_) => {}
        }
    }

    fn hand_back(self: &Arc<Self>, assignment: Assignment) {
        let mut state = self.state.lock();
        self.release(&mut state, assignment);
        self.drain_queue(&mut state);
        self.update_gauges(&state);
    }

    /// Dispatch queued requests into whatever slots are free. Only the head
    /// of each workspace queue is considered, so dispatch stays FIFO.
    fn drain_queue(self: &Arc<Self>, state: &mut PoolState) {
        if state.shutting_down {
            return;
        }

        loop {
            let mut dispatched = false;

            for workspace in state.queue.workspaces_by_arrival() {
                let Some(front) = state.queue.front(&workspace) else {
                    continue;
                };
                let request_id = front.request_id.clone();
                let owner_key = front.owner_key.clone();

                let request = AdmissionRequest {
                    owner_key: &owner_key,
                    workspace_key: &workspace,
                };
                let Some(slot) = self.admission.find_slot(request, &state.registry) else {
                    continue;
                };
                let Some(entry) = state.queue.pop_front(&workspace) else {
                    continue;
                };

                debug!(
                    "Dispatching queued request {} for {} ({})",
                    request_id,
                    workspace,
                    slot.as_str()
                );
                let assignment = self
                    .apply_slot(state, slot, &request_id, &owner_key)
                    .unwrap_or_else(Assignment::Rejected);
                if let Err(returned) = entry.assign(assignment) {
                    debug!("Queued request {} went away before dispatch", request_id);
                    self.release(state, returned);
                }
                dispatched = true;
            }

            if !dispatched {
                break;
            }
        }
    }

    // ---- request lifecycle ----

    async fn serve(
        self: Arc<Self>,
        admitted: Admitted,
        credentials: WorkerCredentials,
        options: QueryOptions,
    ) -> Result<QueryOutcome> {
        let assignment = match admitted {
            Admitted::Now(assignment) => assignment,
            Admitted::Queued(receiver) => self.wait_in_queue(receiver, &options).await?,
        };

        let key = match assignment {
            Assignment::Reuse(key) => key,
            Assignment::Spawn { key, generation } => {
                self.start_worker(&key, generation, &credentials, &options)
                    .await?;
                key
            }
            Assignment::Rejected(e) => return Err(e),
        };

        self.dispatch(key, options).await
    }

    async fn wait_in_queue(
        self: &Arc<Self>,
        mut receiver: oneshot::Receiver<Assignment>,
        options: &QueryOptions,
    ) -> Result<Assignment> {
        tokio::select! {
            assignment = &mut receiver => assignment.map_err(|_| PoolError::ShuttingDown),
            _ = options.cancel.cancelled() => {
                self.withdraw(&options.request_id, receiver);
                Err(PoolError::Cancelled)
            }
        }
    }

    /// Remove a cancelled request from the queue, or give back the slot it
    /// was assigned in the meantime
    fn withdraw(self: &Arc<Self>, request_id: &str, mut receiver: oneshot::Receiver<Assignment>) {
        let mut state = self.state.lock();
        if state.queue.remove(request_id).is_some() {
            debug!("Request {} cancelled while queued", request_id);
        } else if let Ok(assignment) = receiver.try_recv() {
            self.release(&mut state, assignment);
        }
        self.drain_queue(&mut state);
        self.update_gauges(&state);
    }

    async fn start_worker(
        self: &Arc<Self>,
        key: &InstanceKey,
        generation: u64,
        credentials: &WorkerCredentials,
        options: &QueryOptions,
    ) -> Result<()> {
        let socket_path = socket_path(&self.config.socket_dir, key);
        if let Err(e) = prepare_socket(&socket_path).await {
            return Err(self.fail_spawn(key, generation, e));
        }

        let spawn_config = SpawnConfig {
            label: key.to_string(),
            socket_path: socket_path.clone(),
            credentials: credentials.clone(),
        };
        let mut child = match self.processes.spawn(&spawn_config) {
            Ok(child) => child,
            Err(e) => return Err(self.fail_spawn(key, generation, e)),
        };
        let Some(pid) = child.id() else {
            return Err(self.fail_spawn(
                key,
                generation,
                PoolError::ProcessSpawnFailed("worker exited immediately".into()),
            ));
        };

        if !self.record_spawned(key, generation, pid) {
            let _ = child.kill().await;
            return Err(PoolError::ShuttingDown);
        }
        if let Err(e) = orphan_sweeper::write_pid_file(&socket_path, pid) {
            warn!("Failed to write pid file for {}: {}", key, e);
        }

        let ready = tokio::select! {
            ready = self.processes.await_ready(&mut child, &spawn_config.label, self.config.ready_timeout()) => ready,
            _ = options.cancel.cancelled() => Err(PoolError::Cancelled),
        };
        if let Err(e) = ready {
            let _ = child.kill().await;
            if let Err(e) = orphan_sweeper::remove_worker_files(&socket_path) {
                debug!("Failed to clean up after {}: {}", key, e);
            }
            return Err(match e {
                PoolError::Cancelled => {
                    self.abandon_spawn(key, generation);
                    PoolError::Cancelled
                }
                e => self.fail_spawn(key, generation, e),
            });
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        self.watch_exit(key.clone(), generation, child, exited_tx);
        self.record_ready(key, generation, pid, exited_rx, options)
    }

    fn record_spawned(&self, key: &InstanceKey, generation: u64, pid: u32) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.registry.get_generation_mut(key, generation) else {
            return false;
        };
        if entry.record.state != WorkerState::Spawning {
            return false;
        }
        entry.record.pid = Some(pid);

        counter!(WORKERS_SPAWNED).increment(1);
        info!("Spawned worker {} (pid {})", key, pid);
        self.events.publish(PoolEvent::WorkerSpawned {
            workspace_key: key.workspace().to_string(),
            pid,
        });
        true
    }

    fn record_ready(
        &self,
        key: &InstanceKey,
        generation: u64,
        pid: u32,
        exited: watch::Receiver<bool>,
        options: &QueryOptions,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let entry = match state.registry.get_generation_mut(key, generation) {
            Some(entry) if entry.record.state == WorkerState::Spawning => entry,
            _ => {
                // Retired while starting
                let _ = self.processes.force_kill(pid);
                return Err(PoolError::ShuttingDown);
            }
        };

        entry.exited = Some(exited);
        entry.record.transition(WorkerState::Ready)?;
        debug!("Worker {} ready", key);
        self.events.publish(PoolEvent::WorkerReady {
            workspace_key: key.workspace().to_string(),
            pid,
        });

        entry.record.transition(WorkerState::Busy)?;
        entry.record.current_request_id = Some(options.request_id.clone());
        entry.record.last_active_at_ms = now_ms();
        self.events.publish(PoolEvent::WorkerBusy {
            workspace_key: key.workspace().to_string(),
            request_id: options.request_id.clone(),
        });

        self.update_gauges(&state);
        Ok(())
    }

    /// Drop a failed reservation without leaving a record behind
    fn fail_spawn(self: &Arc<Self>, key: &InstanceKey, generation: u64, error: PoolError) -> PoolError {
        let error = match error {
            e @ PoolError::ProcessSpawnFailed(_) => e,
            other => PoolError::ProcessSpawnFailed(other.to_string()),
        };

        let mut state = self.state.lock();
        let ours = state
            .registry
            .get_generation_mut(key, generation)
            .is_some_and(|entry| entry.record.state == WorkerState::Spawning);
        if !ours {
            return PoolError::ShuttingDown;
        }

        state.registry.remove(key);
        counter!(SPAWN_FAILURES).increment(1);
        warn!("Worker {} failed to start: {}", key, error);
        self.events.publish(PoolEvent::PoolError {
            workspace_key: Some(key.workspace().to_string()),
            context: "spawn".into(),
            message: error.to_string(),
        });

        self.drain_queue(&mut state);
        self.update_gauges(&state);
        error
    }

    fn abandon_spawn(self: &Arc<Self>, key: &InstanceKey, generation: u64) {
        self.hand_back(Assignment::Spawn {
            key: key.clone(),
            generation,
        });
    }

    /// Own the child until it exits, then flip the exit watch
    fn watch_exit(
        self: &Arc<Self>,
        key: InstanceKey,
        generation: u64,
        mut child: Child,
        exited: watch::Sender<bool>,
    ) {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            exited.send_replace(true);
            debug!("Worker {} exited: {:?}", key, status);
            if let Some(pool) = pool.upgrade() {
                pool.on_worker_exit(&key, generation);
            }
        });
    }

    fn on_worker_exit(self: &Arc<Self>, key: &InstanceKey, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.registry.get_generation_mut(key, generation) else {
            return;
        };

        // Busy workers are reported by the request; draining ones are
        // already being retired
        if !entry.record.state.is_available() {
            return;
        }

        warn!("Worker {} exited unexpectedly", key);
        self.events.publish(PoolEvent::PoolError {
            workspace_key: Some(key.workspace().to_string()),
            context: "worker_exit".into(),
            message: format!("worker {} exited while idle", key),
        });
        if let Some(ticket) = self.begin_retire(&mut state, key, RetireReason::Fault) {
            self.spawn_retire(ticket);
        }
        self.update_gauges(&state);
    }

    async fn dispatch(self: &Arc<Self>, key: InstanceKey, options: QueryOptions) -> Result<QueryOutcome> {
        let QueryOptions {
            request_id,
            workload_class,
            payload,
            on_message,
            cancel,
            ..
        } = options;

        if cancel.is_cancelled() {
            self.hand_back(Assignment::Reuse(key));
            return Err(PoolError::Cancelled);
        }

        let socket_path = socket_path(&self.config.socket_dir, &key);
        let mut connection =
            match Connection::connect(&socket_path, self.config.ready_timeout()).await {
                Ok(connection) => connection,
                Err(e) => return Err(self.fault(&key, &request_id, e.to_string())),
            };

        let query = PoolFrame::Query {
            request_id: request_id.clone(),
            workload_class,
            payload,
        };
        if let Err(e) = connection.send(&query).await {
            return Err(self.fault(&key, &request_id, e.to_string()));
        }

        let mut messages = 0u64;
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_in_flight(key, request_id, connection);
                    return Err(PoolError::Cancelled);
                }
                frame = connection.recv::<WorkerFrame>() => frame,
            };

            match frame {
                Ok(Some(frame)) if frame.request_id().is_some_and(|id| id != request_id) => {
                    debug!("Ignoring frame for {:?} on {}", frame.request_id(), key);
                }
                Ok(Some(WorkerFrame::Message { content, .. })) => {
                    messages += 1;
                    if let Some(sink) = &on_message {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => continue,
                            sent = sink.send(content) => {
                                if sent.is_err() {
                                    debug!("Message sink for {} closed", request_id);
                                }
                            }
                        }
                    }
                }
                Ok(Some(WorkerFrame::Complete { result, .. })) => {
                    self.complete_turn(&key, &request_id);
                    return Ok(QueryOutcome {
                        request_id,
                        instance_key: key,
                        result,
                        messages,
                    });
                }
                Ok(Some(WorkerFrame::Error { message, .. })) => {
                    self.complete_turn(&key, &request_id);
                    return Err(PoolError::WorkerError(message));
                }
                Ok(Some(WorkerFrame::Cancelled { .. })) => {
                    self.complete_turn(&key, &request_id);
                    return Err(PoolError::Cancelled);
                }
                Ok(Some(WorkerFrame::ShutdownAck)) => {
                    debug!("Worker {} acknowledged shutdown mid-request", key);
                }
                Ok(None) => {
                    return Err(self.fault(
                        &key,
                        &request_id,
                        "worker closed the connection mid-request".into(),
                    ))
                }
                Err(e) => return Err(self.fault(&key, &request_id, e.to_string())),
            }
        }
    }

    /// Turn finished: back to idle unless the worker is being retired
    fn complete_turn(self: &Arc<Self>, key: &InstanceKey, request_id: &str) {
        let mut state = self.state.lock();
        let Some(entry) = state.registry.get_mut(key) else {
            return;
        };
        if entry.record.current_request_id.as_deref() != Some(request_id) {
            return;
        }

        entry.record.current_request_id = None;
        entry.record.requests_served += 1;
        entry.record.last_active_at_ms = now_ms();
        if entry.record.transition(WorkerState::Idle).is_ok() {
            entry.owner_key = None;
            self.events.publish(PoolEvent::WorkerIdle {
                workspace_key: key.workspace().to_string(),
            });
        }

        self.drain_queue(&mut state);
        self.update_gauges(&state);
    }

    /// The worker failed mid-request: retire it, never reuse it
    fn fault(self: &Arc<Self>, key: &InstanceKey, request_id: &str, message: String) -> PoolError {
        let mut state = self.state.lock();
        let owns_request = state
            .registry
            .get(key)
            .is_some_and(|entry| entry.record.current_request_id.as_deref() == Some(request_id));

        if owns_request {
            if let Some(ticket) = self.begin_retire(&mut state, key, RetireReason::Fault) {
                warn!("Worker {} faulted during {}: {}", key, request_id, message);
                self.events.publish(PoolEvent::PoolError {
                    workspace_key: Some(key.workspace().to_string()),
                    context: "request".into(),
                    message: message.clone(),
                });
                self.spawn_retire(ticket);
            }
            self.drain_queue(&mut state);
            self.update_gauges(&state);
        }

        PoolError::WorkerFault(message)
    }

    /// Signal the cancel and settle the worker's fate in the background:
    /// idle if acknowledged within `cancel_timeout_ms`, retired otherwise
    fn cancel_in_flight(self: &Arc<Self>, key: InstanceKey, request_id: String, mut connection: Connection) {
        debug!("Cancelling request {} on {}", request_id, key);
        let pool = Arc::clone(self);
        let timeout = self.config.cancel_timeout();

        tokio::spawn(async move {
            let acknowledged = tokio::time::timeout(timeout, async {
                let frame = PoolFrame::Cancel {
                    request_id: request_id.clone(),
                };
                if connection.send(&frame).await.is_err() {
                    return false;
                }
                loop {
                    match connection.recv::<WorkerFrame>().await {
                        Ok(Some(frame)) if frame.request_id() != Some(request_id.as_str()) => {}
                        Ok(Some(
                            WorkerFrame::Cancelled { .. }
                            | WorkerFrame::Complete { .. }
                            | WorkerFrame::Error { .. },
                        )) => return true,
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => return false,
                    }
                }
            })
            .await
            .unwrap_or(false);

            if acknowledged {
                pool.complete_turn(&key, &request_id);
            } else {
                pool.retire_after_cancel(&key, &request_id);
            }
        });
    }

    fn retire_after_cancel(self: &Arc<Self>, key: &InstanceKey, request_id: &str) {
        let mut state = self.state.lock();
        let owns_request = state
            .registry
            .get(key)
            .is_some_and(|entry| entry.record.current_request_id.as_deref() == Some(request_id));
        if !owns_request {
            return;
        }

        if let Some(ticket) = self.begin_retire(&mut state, key, RetireReason::CancelTimeout) {
            state.retired_after_cancel += 1;
            warn!(
                "Worker {} did not acknowledge cancel of {} within {}ms, retiring",
                key, request_id, self.config.cancel_timeout_ms
            );
            self.spawn_retire(ticket);
        }
        self.drain_queue(&mut state);
        self.update_gauges(&state);
    }

    // ---- retirement ----

    /// Mark a worker draining and issue its ticket. `None` if it is unknown
    /// or already on its way out.
    fn begin_retire(
        &self,
        state: &mut PoolState,
        key: &InstanceKey,
        reason: RetireReason,
    ) -> Option<RetireTicket> {
        let entry = state.registry.get_mut(key)?;
        if !entry.record.state.is_live() {
            return None;
        }
        if let Err(e) = entry.record.transition(WorkerState::Draining) {
            warn!("Cannot retire worker {}: {}", key, e);
            return None;
        }
        entry.owner_key = None;
        info!("Retiring worker {} ({})", key, reason.as_str());

        Some(RetireTicket {
            key: key.clone(),
            generation: entry.generation,
            pid: entry.record.pid,
            socket_path: entry.record.socket_path.clone(),
            exited: entry.exited.clone(),
            reason,
        })
    }

    fn spawn_retire(self: &Arc<Self>, ticket: RetireTicket) {
        tokio::spawn(Arc::clone(self).retire(ticket));
    }

    async fn retire_all(self: &Arc<Self>, tickets: Vec<RetireTicket>) -> usize {
        let count = tickets.len();
        join_all(tickets.into_iter().map(|ticket| Arc::clone(self).retire(ticket))).await;
        count
    }

    async fn retire(self: Arc<Self>, mut ticket: RetireTicket) {
        // Not ready yet: there is no socket to talk to
        if ticket.exited.is_none() {
            if let Some(pid) = ticket.pid {
                let _ = self.processes.force_kill(pid);
            }
        }

        let outcome = retire_process(
            &self.processes,
            &mut ticket,
            self.config.shutdown_timeout(),
            self.config.kill_grace(),
        )
        .await;

        // A survivor keeps its socket and pid file so the orphan sweeper
        // can retry the kill
        if outcome != RetireOutcome::Unresponsive {
            if let Err(e) = orphan_sweeper::remove_worker_files(&ticket.socket_path) {
                self.report_error(
                    Some(&ticket.key),
                    "retire",
                    format!("Failed to remove {:?}: {}", ticket.socket_path, e),
                );
            }
        }

        self.finish_retire(&ticket, outcome);
    }

    fn finish_retire(self: &Arc<Self>, ticket: &RetireTicket, outcome: RetireOutcome) {
        if outcome == RetireOutcome::Unresponsive {
            self.report_error(
                Some(&ticket.key),
                "retire",
                format!(
                    "worker {} (pid {:?}) still running after SIGKILL",
                    ticket.key, ticket.pid
                ),
            );
        }

        let mut state = self.state.lock();
        if let Some(entry) = state.registry.get_generation_mut(&ticket.key, ticket.generation) {
            let _ = entry.record.transition(WorkerState::Dead);
            state.registry.remove(&ticket.key);
        }

        counter!(WORKERS_RETIRED, "reason" => ticket.reason.as_str()).increment(1);
        info!("Worker {} retired ({:?})", ticket.key, outcome);

        self.drain_queue(&mut state);
        self.update_gauges(&state);
    }

    fn begin_retire_workspace(&self, workspace_key: &str) -> Vec<RetireTicket> {
        let mut state = self.state.lock();
        let keys = state.registry.instances_of(workspace_key);
        let tickets: Vec<RetireTicket> = keys
            .iter()
            .filter_map(|key| self.begin_retire(&mut state, key, RetireReason::Shutdown))
            .collect();
        self.update_gauges(&state);
        tickets
    }

    fn begin_shutdown(&self) -> Vec<RetireTicket> {
        let mut state = self.state.lock();
        state.shutting_down = true;

        let queued = state.queue.drain_all();
        if !queued.is_empty() {
            info!("Rejecting {} queued requests for shutdown", queued.len());
        }
        for entry in queued {
            let _ = entry.assign(Assignment::Rejected(PoolError::ShuttingDown));
        }

        let mut keys = state.registry.keys();
        keys.sort();
        let tickets: Vec<RetireTicket> = keys
            .iter()
            .filter_map(|key| self.begin_retire(&mut state, key, RetireReason::Shutdown))
            .collect();
        self.update_gauges(&state);
        tickets
    }

    async fn run_eviction_cycle(self: &Arc<Self>) -> usize {
        let tickets = {
            let mut state = self.state.lock();
            let stale = stale_workers(
                state.registry.records(),
                now_ms(),
                self.config.inactivity_timeout_ms,
                self.config.max_age_ms,
            );
            let tickets: Vec<RetireTicket> = stale
                .into_iter()
                .filter_map(|(key, reason)| self.begin_retire(&mut state, &key, reason))
                .collect();

            // Requests held back only by shedding have no other wake-up
            if !state.queue.is_empty() {
                self.drain_queue(&mut state);
            }
            self.update_gauges(&state);
            tickets
        };

        if !tickets.is_empty() {
            debug!("Eviction cycle retiring {} stale workers", tickets.len());
        }
        self.retire_all(tickets).await
    }

    // ---- orphan sweep ----

    async fn sweep_orphans(self: &Arc<Self>) -> SweepReport {
        let mut report = SweepReport::default();
        let live = self.reap_dead_records(&mut report);

        let dir = self.config.socket_dir.clone();
        let max_age = Duration::from_millis(self.config.orphan_max_age_ms);
        let scan_dir = dir.clone();
        let swept = tokio::task::spawn_blocking(move || -> Result<_> {
            let scan = orphan_sweeper::scan_sockets(&scan_dir, &live, SystemTime::now(), max_age)?;
            let reaped: Vec<(OrphanSocket, Result<bool>)> = scan
                .orphans
                .into_iter()
                .map(|orphan| {
                    let result = orphan_sweeper::reap_socket(&orphan);
                    (orphan, result)
                })
                .collect();
            Ok((scan.young, reaped))
        })
        .await;

        match swept {
            Ok(Ok((young, reaped))) => {
                report.skipped_young = young;
                for (orphan, result) in reaped {
                    match result {
                        Ok(killed) => {
                            report.sockets_reaped += 1;
                            if killed {
                                report.processes_killed += 1;
                            }
                        }
                        Err(e) => {
                            report.failures += 1;
                            self.report_error(
                                None,
                                "orphan_sweep",
                                format!("Failed to reap {:?}: {}", orphan.socket_path, e),
                            );
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                report.failures += 1;
                self.report_error(None, "orphan_sweep", format!("Failed to scan {:?}: {}", dir, e));
            }
            Err(e) => {
                report.failures += 1;
                self.report_error(None, "orphan_sweep", format!("Sweep task failed: {}", e));
            }
        }

        self.record_reaped(&report);
        report
    }

    /// Drop idle records whose process is gone; returns the sockets that
    /// are still claimed by a record
    fn reap_dead_records(&self, report: &mut SweepReport) -> HashSet<PathBuf> {
        let mut state = self.state.lock();
        let now = now_ms();
        let max_age = self.config.orphan_max_age_ms;

        let dead: Vec<InstanceKey> = state
            .registry
            .records()
            .filter(|record| record.state.is_available() && record.age_ms(now) >= max_age)
            .filter(|record| record.pid.is_some_and(|pid| !is_running(pid)))
            .map(|record| record.instance_key.clone())
            .collect();

        for key in dead {
            warn!("Removing worker {} whose process is gone", key);
            if let Some(entry) = state.registry.remove(&key) {
                if let Err(e) = orphan_sweeper::remove_worker_files(&entry.record.socket_path) {
                    debug!("Failed to remove files of {}: {}", key, e);
                }
            }
            report.records_removed += 1;
        }

        state
            .registry
            .records()
            .map(|record| record.socket_path.clone())
            .collect()
    }

    fn record_reaped(self: &Arc<Self>, report: &SweepReport) {
        let reaped = report.reaped() as u64;
        let mut state = self.state.lock();
        state.orphans_reaped += reaped;
        if reaped > 0 {
            counter!(ORPHANS_REAPED).increment(reaped);
            info!(
                "Orphan sweep reaped {} ({} sockets, {} processes killed, {} records)",
                reaped, report.sockets_reaped, report.processes_killed, report.records_removed
            );
        }
        if report.records_removed > 0 {
            self.drain_queue(&mut state);
        }
        self.update_gauges(&state);
    }

    // ---- reporting ----

    fn report_error(&self, key: Option<&InstanceKey>, context: &str, message: String) {
        warn!("{}: {}", context, message);
        self.events.publish(PoolEvent::PoolError {
            workspace_key: key.map(|key| key.workspace().to_string()),
            context: context.to_string(),
            message,
        });
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total_workers: state.registry.len(),
            active_workers: state.registry.count_in_state(WorkerState::Busy),
            idle_workers: state.registry.count_in_state(WorkerState::Idle)
                + state.registry.count_in_state(WorkerState::Ready),
            max_workers: self.config.max_workers,
            dynamic_max_workers: self.admission.dynamic_max_workers(),
            retired_after_cancel: state.retired_after_cancel,
            orphans_reaped: state.orphans_reaped,
            queued_requests: state.queue.len(),
        }
    }

    fn update_gauges(&self, state: &PoolState) {
        let idle = state.registry.count_in_state(WorkerState::Idle)
            + state.registry.count_in_state(WorkerState::Ready);
        gauge!(WORKERS_TOTAL).set(state.registry.len() as f64);
        gauge!(WORKERS_BUSY).set(state.registry.count_in_state(WorkerState::Busy) as f64);
        gauge!(WORKERS_IDLE).set(idle as f64);
        gauge!(QUEUE_DEPTH).set(state.queue.len() as f64);
    }
}

/// Make sure the socket directory exists and nothing stale sits at the path
async fn prepare_socket(socket_path: &Path) -> Result<()> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let stale = OrphanSocket {
        socket_path: socket_path.to_path_buf(),
        pid: orphan_sweeper::read_pid_file(socket_path),
        age: Duration::ZERO,
    };
    if orphan_sweeper::reap_socket(&stale)? {
        info!(
            "Killed stale worker pid {:?} holding {:?}",
            stale.pid.map(|recorded| recorded.pid),
            socket_path
        );
    }
    Ok(())
}
