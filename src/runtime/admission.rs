// src/runtime/admission.rs
//! Admission control: reuse → spawn → queue → reject
//!
//! Decisions are pure functions of the registry, the queue, and the host
//! probe. The pool takes them and applies the reservation under the same
//! lock, before any await, so two concurrent requests never pass one quota
//! check against the same counts.
//!
//! The dynamic ceiling is recomputed on every decision:
//!
//! ```text
//! dynamic_max = min(max_workers, max(1, floor(workers_per_core × cores)))
//! busy        = max(host load / cores, busy workers / dynamic_max)
//! ```
//!
//! Spawns are shed while `busy > load_shed_threshold`. Both readings are
//! clamped to `[0, 1]`, so a threshold of `1.0` turns shedding off.

use crate::runtime::eviction::select_victim;
use crate::runtime::registry::WorkerRegistry;
use crate::runtime::request_queue::RequestQueue;
use crate::runtime::worker::{InstanceKey, WorkerState};
use crate::utils::config::PoolConfig;
use crate::utils::host::HostProbe;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch on an available instance of the workspace
    Reuse(InstanceKey),
    /// Start a new instance
    Spawn(InstanceKey),
    /// Retire an idle instance elsewhere, then start a new one
    EvictAndSpawn {
        victim: InstanceKey,
        key: InstanceKey,
    },
    /// Wait for a slot
    Queue,
    /// Saturated; the reason names the exhausted queue limit
    Reject(String),
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Reuse(_) => "reuse",
            Admission::Spawn(_) => "spawn",
            Admission::EvictAndSpawn { .. } => "evict_and_spawn",
            Admission::Queue => "queue",
            Admission::Reject(_) => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub owner_key: &'a str,
    pub workspace_key: &'a str,
}

#[derive(Clone)]
pub struct AdmissionController {
    config: Arc<PoolConfig>,
    host: Arc<dyn HostProbe>,
}

impl AdmissionController {
    pub fn new(config: Arc<PoolConfig>, host: Arc<dyn HostProbe>) -> Self {
        Self { config, host }
    }

    pub fn dynamic_max_workers(&self) -> usize {
        let scaled = (self.config.workers_per_core * self.host.available_cores() as f64).floor();
        (scaled as usize).max(1).min(self.config.max_workers)
    }

    /// Global busy fraction in `[0, 1]`
    pub fn busy_fraction(&self, registry: &WorkerRegistry) -> f64 {
        let busy = registry.count_in_state(WorkerState::Busy) as f64;
        let pool = (busy / self.dynamic_max_workers() as f64).min(1.0);
        self.host.load_fraction().clamp(0.0, 1.0).max(pool)
    }

    pub fn is_shedding(&self, registry: &WorkerRegistry) -> bool {
        self.busy_fraction(registry) > self.config.load_shed_threshold
    }

    /// Decide for a new arrival
    pub fn decide(
        &self,
        request: AdmissionRequest<'_>,
        registry: &WorkerRegistry,
        queue: &RequestQueue,
    ) -> Admission {
        // Arrivals never overtake requests already waiting for the workspace
        if queue.queued_for_workspace(request.workspace_key) == 0 {
            if let Some(slot) = self.find_slot(request, registry) {
                return slot;
            }
        }
        self.queue_or_reject(request, queue)
    }

    /// Find a slot without considering the queue. Used for arrivals and
    /// when draining queued requests.
    pub fn find_slot(
        &self,
        request: AdmissionRequest<'_>,
        registry: &WorkerRegistry,
    ) -> Option<Admission> {
        if registry.active_for_owner(request.owner_key) >= self.config.max_workers_per_user {
            return None;
        }

        if let Some(key) = registry.available_instance(request.workspace_key) {
            return Some(Admission::Reuse(key));
        }

        if registry.live_for_workspace(request.workspace_key)
            >= self.config.max_workers_per_workspace
        {
            return None;
        }

        if self.is_shedding(registry) {
            return None;
        }

        let key = registry.next_instance_key(request.workspace_key);
        if registry.live_count() < self.dynamic_max_workers() {
            return Some(Admission::Spawn(key));
        }

        // A draining victim keeps its process until it exits; one eviction
        // at a time bounds the overshoot to a single process.
        if registry.count_in_state(WorkerState::Draining) > 0 {
            return None;
        }

        let victim = select_victim(self.config.eviction_strategy, registry.idle_records())?;
        Some(Admission::EvictAndSpawn {
            victim: victim.instance_key.clone(),
            key,
        })
    }

    fn queue_or_reject(&self, request: AdmissionRequest<'_>, queue: &RequestQueue) -> Admission {
        let limits = [
            (
                "per-user",
                queue.queued_for_owner(request.owner_key),
                self.config.max_queued_per_user,
            ),
            (
                "per-workspace",
                queue.queued_for_workspace(request.workspace_key),
                self.config.max_queued_per_workspace,
            ),
            ("global", queue.len(), self.config.max_queued_global),
        ];

        match limits.iter().find(|(_, queued, limit)| queued >= limit) {
            Some((scope, queued, limit)) => Admission::Reject(format!(
                "{} queue limit reached ({}/{})",
                scope, queued, limit
            )),
            None => Admission::Queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::tests::add_worker;
    use crate::runtime::request_queue::QueueEntry;
    use crate::utils::host::FixedHostProbe;

    fn controller(config: PoolConfig, probe: FixedHostProbe) -> AdmissionController {
        AdmissionController::new(Arc::new(config), Arc::new(probe))
    }

    fn request<'a>(owner: &'a str, workspace: &'a str) -> AdmissionRequest<'a> {
        AdmissionRequest {
            owner_key: owner,
            workspace_key: workspace,
        }
    }

    fn enqueue(queue: &mut RequestQueue, id: &str, owner: &str, workspace: &str) {
        queue.push(QueueEntry::new(id, owner, workspace, "interactive", 0).0);
    }

    #[test]
    fn test_dynamic_max_workers() {
        let config = PoolConfig {
            max_workers: 20,
            workers_per_core: 1.5,
            ..Default::default()
        };
        assert_eq!(controller(config.clone(), FixedHostProbe::new(4)).dynamic_max_workers(), 6);
        assert_eq!(controller(config.clone(), FixedHostProbe::new(64)).dynamic_max_workers(), 20);
        assert_eq!(controller(config, FixedHostProbe::new(0)).dynamic_max_workers(), 1);
    }

    #[test]
    fn test_reuse_idle_instance() {
        let admission = controller(PoolConfig::default(), FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        let idle = add_worker(&mut registry, "ws", "u1", WorkerState::Idle);

        let decision = admission.decide(request("u2", "ws"), &registry, &RequestQueue::new());
        assert_eq!(decision, Admission::Reuse(idle));
    }

    #[test]
    fn test_spawn_when_workspace_busy() {
        let admission = controller(PoolConfig::default(), FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "ws", "u1", WorkerState::Busy);

        let decision = admission.decide(request("u2", "ws"), &registry, &RequestQueue::new());
        assert_eq!(decision, Admission::Spawn(InstanceKey::new("ws", 1)));
    }

    #[test]
    fn test_per_user_cap_is_independent_of_workspace() {
        let config = PoolConfig {
            max_workers_per_user: 1,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u1", WorkerState::Busy);
        let queue = RequestQueue::new();

        assert_eq!(admission.decide(request("u1", "b"), &registry, &queue), Admission::Queue);
        assert_eq!(
            admission.decide(request("u2", "b"), &registry, &queue),
            Admission::Spawn(InstanceKey::new("b", 0))
        );
    }

    #[test]
    fn test_per_workspace_cap() {
        let config = PoolConfig {
            max_workers_per_workspace: 1,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "ws", "u1", WorkerState::Busy);

        let decision = admission.decide(request("u2", "ws"), &registry, &RequestQueue::new());
        assert_eq!(decision, Admission::Queue);
    }

    #[test]
    fn test_evict_idle_at_capacity() {
        let config = PoolConfig {
            max_workers: 2,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u1", WorkerState::Busy);
        let idle = add_worker(&mut registry, "b", "u1", WorkerState::Idle);

        let decision = admission.decide(request("u2", "c"), &registry, &RequestQueue::new());
        assert_eq!(
            decision,
            Admission::EvictAndSpawn {
                victim: idle,
                key: InstanceKey::new("c", 0),
            }
        );
    }

    #[test]
    fn test_no_idle_victim_means_queue() {
        let config = PoolConfig {
            max_workers: 1,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u1", WorkerState::Busy);

        let decision = admission.decide(request("u2", "c"), &registry, &RequestQueue::new());
        assert_eq!(decision, Admission::Queue);
    }

    #[test]
    fn test_load_shedding_blocks_spawns_only() {
        let admission = controller(PoolConfig::default(), FixedHostProbe::new(8).with_load(0.95));
        let mut registry = WorkerRegistry::new();
        let idle = add_worker(&mut registry, "a", "u1", WorkerState::Idle);
        let queue = RequestQueue::new();

        assert!(admission.is_shedding(&registry));
        assert_eq!(admission.decide(request("u1", "a"), &registry, &queue), Admission::Reuse(idle));
        assert_eq!(admission.decide(request("u1", "b"), &registry, &queue), Admission::Queue);
    }

    #[test]
    fn test_busy_pool_counts_toward_shedding() {
        let config = PoolConfig {
            max_workers: 4,
            load_shed_threshold: 0.7,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        for workspace in ["a", "b"] {
            add_worker(&mut registry, workspace, "u1", WorkerState::Busy);
        }
        assert_eq!(admission.busy_fraction(&registry), 0.5);
        assert_eq!(
            admission.decide(request("u2", "c"), &registry, &RequestQueue::new()),
            Admission::Spawn(InstanceKey::new("c", 0))
        );

        add_worker(&mut registry, "c", "u2", WorkerState::Busy);
        assert_eq!(admission.busy_fraction(&registry), 0.75);
        assert!(admission.is_shedding(&registry));
        assert_eq!(
            admission.decide(request("u3", "d"), &registry, &RequestQueue::new()),
            Admission::Queue
        );
    }

    #[test]
    fn test_threshold_of_one_never_sheds() {
        let config = PoolConfig {
            max_workers: 2,
            load_shed_threshold: 1.0,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8).with_load(7.5));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u1", WorkerState::Busy);
        add_worker(&mut registry, "b", "u1", WorkerState::Busy);

        assert_eq!(admission.busy_fraction(&registry), 1.0);
        assert!(!admission.is_shedding(&registry));
    }

    #[test]
    fn test_one_eviction_in_flight() {
        let config = PoolConfig {
            max_workers: 2,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u1", WorkerState::Idle);
        add_worker(&mut registry, "b", "u1", WorkerState::Idle);
        add_worker(&mut registry, "c", "u2", WorkerState::Draining);

        // Full, with a victim still draining: wait rather than evict again
        assert_eq!(
            admission.decide(request("u3", "d"), &registry, &RequestQueue::new()),
            Admission::Queue
        );

        registry.remove(&InstanceKey::new("c", 0));
        assert!(matches!(
            admission.decide(request("u3", "d"), &registry, &RequestQueue::new()),
            Admission::EvictAndSpawn { .. }
        ));
    }

    #[test]
    fn test_tightest_queue_limit_rejects() {
        let config = PoolConfig {
            max_workers: 1,
            max_queued_per_user: 1,
            max_queued_per_workspace: 5,
            max_queued_global: 5,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u0", WorkerState::Busy);
        let mut queue = RequestQueue::new();
        enqueue(&mut queue, "r1", "u1", "b");

        match admission.decide(request("u1", "c"), &registry, &queue) {
            Admission::Reject(reason) => assert!(reason.contains("per-user")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(admission.decide(request("u2", "c"), &registry, &queue), Admission::Queue);
    }

    #[test]
    fn test_arrivals_wait_behind_queued_workspace() {
        let admission = controller(PoolConfig::default(), FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "ws", "u1", WorkerState::Idle);
        let mut queue = RequestQueue::new();
        enqueue(&mut queue, "r1", "u2", "ws");

        assert_eq!(admission.decide(request("u3", "ws"), &registry, &queue), Admission::Queue);
    }

    #[test]
    fn test_owner_and_workspace_scenario() {
        let config = PoolConfig {
            max_workers: 2,
            max_workers_per_user: 1,
            max_queued_global: 1,
            ..Default::default()
        };
        let admission = controller(config, FixedHostProbe::new(8));
        let mut registry = WorkerRegistry::new();
        let mut queue = RequestQueue::new();

        // A: u1 on workspace a spawns worker 1
        assert_eq!(
            admission.decide(request("u1", "a"), &registry, &queue),
            Admission::Spawn(InstanceKey::new("a", 0))
        );
        add_worker(&mut registry, "a", "u1", WorkerState::Busy);

        // B: u1 on workspace b hits the per-user ceiling
        assert_eq!(admission.decide(request("u1", "b"), &registry, &queue), Admission::Queue);
        enqueue(&mut queue, "B", "u1", "b");

        // C: u2 on workspace c spawns worker 2
        assert_eq!(
            admission.decide(request("u2", "c"), &registry, &queue),
            Admission::Spawn(InstanceKey::new("c", 0))
        );
        add_worker(&mut registry, "c", "u2", WorkerState::Busy);

        // D: u3 finds no slot and no queue room
        assert!(matches!(
            admission.decide(request("u3", "d"), &registry, &queue),
            Admission::Reject(reason) if reason.contains("global")
        ));
    }
}
