// src/runtime/registry.rs
//! Worker registry: instance key → worker record
//!
//! Fairness counts (active workers per owner, live instances per workspace)
//! are computed from the records on every call rather than kept as separate
//! counters, so they always match the registry.

use crate::runtime::worker::{InstanceKey, WorkerRecord, WorkerState};
use crate::utils::errors::{PoolError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::watch;

/// Registry entry: the public record plus bookkeeping the pool needs
#[derive(Debug)]
pub struct WorkerEntry {
    pub record: WorkerRecord,

    /// Owner the worker is currently attributed to (spawning or busy)
    pub owner_key: Option<String>,

    /// Flips to `true` when the process has exited
    pub exited: Option<watch::Receiver<bool>>,

    /// Distinguishes reservations that reuse an instance key
    pub generation: u64,
}

impl WorkerEntry {
    /// Spawning or busy on behalf of `owner`
    pub fn is_active_for(&self, owner: &str) -> bool {
        matches!(
            self.record.state,
            WorkerState::Spawning | WorkerState::Ready | WorkerState::Busy
        ) && self.owner_key.as_deref() == Some(owner)
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    entries: HashMap<InstanceKey, WorkerEntry>,
    next_generation: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a new instance in `spawning` state; returns its generation
    pub fn insert_spawning(
        &mut self,
        key: InstanceKey,
        socket_path: PathBuf,
        owner_key: &str,
        now_ms: u64,
    ) -> Result<u64> {
        if self.entries.contains_key(&key) {
            return Err(PoolError::InvalidRequest(format!(
                "Worker {} is already registered",
                key
            )));
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let record = WorkerRecord::new(key.clone(), socket_path, now_ms);
        self.entries.insert(
            key,
            WorkerEntry {
                record,
                owner_key: Some(owner_key.to_string()),
                exited: None,
                generation,
            },
        );
        Ok(generation)
    }

    pub fn get(&self, key: &InstanceKey) -> Option<&WorkerEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &InstanceKey) -> Option<&mut WorkerEntry> {
        self.entries.get_mut(key)
    }

    /// Entry for `key` only if it is still the reservation `generation`
    pub fn get_generation_mut(
        &mut self,
        key: &InstanceKey,
        generation: u64,
    ) -> Option<&mut WorkerEntry> {
        self.entries
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
    }

    pub fn remove(&mut self, key: &InstanceKey) -> Option<WorkerEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&InstanceKey, &WorkerEntry)> {
        self.entries.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.entries.values().map(|entry| &entry.record)
    }

    pub fn keys(&self) -> Vec<InstanceKey> {
        self.entries.keys().cloned().collect()
    }

    /// Keys of every instance of a workspace, in instance order
    pub fn instances_of(&self, workspace: &str) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self
            .entries
            .keys()
            .filter(|key| key.workspace() == workspace)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Lowest-index available instance of a workspace
    pub fn available_instance(&self, workspace: &str) -> Option<InstanceKey> {
        self.entries
            .iter()
            .filter(|(key, entry)| key.workspace() == workspace && entry.record.state.is_available())
            .map(|(key, _)| key)
            .min()
            .cloned()
    }

    /// Smallest unused instance index for a workspace
    pub fn next_instance_key(&self, workspace: &str) -> InstanceKey {
        let index = (0u32..)
            .find(|i| !self.entries.contains_key(&InstanceKey::new(workspace, *i)))
            .unwrap_or(u32::MAX);
        InstanceKey::new(workspace, index)
    }

    /// Workers that count against capacity (everything but draining)
    pub fn live_count(&self) -> usize {
        self.count_where(|entry| entry.record.state.is_live())
    }

    pub fn live_for_workspace(&self, workspace: &str) -> usize {
        self.count_where(|entry| {
            entry.record.state.is_live() && entry.record.workspace_key == workspace
        })
    }

    pub fn active_for_owner(&self, owner: &str) -> usize {
        self.count_where(|entry| entry.is_active_for(owner))
    }

    pub fn count_in_state(&self, state: WorkerState) -> usize {
        self.count_where(|entry| entry.record.state == state)
    }

    /// Workers in `idle`, the only eviction candidates
    pub fn idle_records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records()
            .filter(|record| record.state == WorkerState::Idle)
    }

    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self.records().cloned().collect();
        records.sort_by(|a, b| a.instance_key.cmp(&b.instance_key));
        records
    }

    fn count_where(&self, predicate: impl Fn(&WorkerEntry) -> bool) -> usize {
        self.entries.values().filter(|entry| predicate(entry)).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Insert a worker and walk it to `state`
    pub(crate) fn add_worker(
        registry: &mut WorkerRegistry,
        workspace: &str,
        owner: &str,
        state: WorkerState,
    ) -> InstanceKey {
        let key = registry.next_instance_key(workspace);
        let socket = PathBuf::from(format!("/tmp/{}.sock", key));
        registry.insert_spawning(key.clone(), socket, owner, 0).unwrap();

        let path: &[WorkerState] = match state {
            WorkerState::Spawning => &[],
            WorkerState::Ready => &[WorkerState::Ready],
            WorkerState::Busy => &[WorkerState::Ready, WorkerState::Busy],
            WorkerState::Idle => &[WorkerState::Ready, WorkerState::Idle],
            WorkerState::Draining => &[WorkerState::Ready, WorkerState::Draining],
            WorkerState::Dead => &[WorkerState::Dead],
        };
        let entry = registry.get_mut(&key).unwrap();
        for next in path {
            entry.record.transition(*next).unwrap();
        }
        if !matches!(state, WorkerState::Spawning | WorkerState::Ready | WorkerState::Busy) {
            entry.owner_key = None;
        }
        key
    }

    #[test]
    fn test_instance_keys_fill_gaps() {
        let mut registry = WorkerRegistry::new();
        let first = add_worker(&mut registry, "ws", "u1", WorkerState::Idle);
        let second = add_worker(&mut registry, "ws", "u1", WorkerState::Busy);
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);

        registry.remove(&first);
        assert_eq!(registry.next_instance_key("ws").index(), 0);
        assert_eq!(registry.next_instance_key("other").index(), 0);
    }

    #[test]
    fn test_generation_guards_reused_keys() {
        let mut registry = WorkerRegistry::new();
        let key = InstanceKey::new("ws", 0);
        let first = registry
            .insert_spawning(key.clone(), PathBuf::from("/tmp/a"), "u1", 0)
            .unwrap();
        registry.remove(&key);
        let second = registry
            .insert_spawning(key.clone(), PathBuf::from("/tmp/a"), "u1", 0)
            .unwrap();

        assert_ne!(first, second);
        assert!(registry.get_generation_mut(&key, first).is_none());
        assert!(registry.get_generation_mut(&key, second).is_some());
    }

    #[test]
    fn test_duplicate_reservation_rejected() {
        let mut registry = WorkerRegistry::new();
        let key = InstanceKey::new("ws", 0);
        registry
            .insert_spawning(key.clone(), PathBuf::from("/tmp/a"), "u1", 0)
            .unwrap();
        assert!(registry
            .insert_spawning(key, PathBuf::from("/tmp/a"), "u1", 0)
            .is_err());
    }

    #[test]
    fn test_fairness_counts_are_derived() {
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "a", "u1", WorkerState::Busy);
        add_worker(&mut registry, "b", "u1", WorkerState::Spawning);
        add_worker(&mut registry, "a", "u2", WorkerState::Idle);
        add_worker(&mut registry, "c", "u3", WorkerState::Draining);

        assert_eq!(registry.active_for_owner("u1"), 2);
        assert_eq!(registry.active_for_owner("u2"), 0);
        assert_eq!(registry.live_for_workspace("a"), 2);
        assert_eq!(registry.live_for_workspace("c"), 0);
        assert_eq!(registry.live_count(), 3);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_available_instance_prefers_lowest_index() {
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "ws", "u1", WorkerState::Busy);
        let idle_one = add_worker(&mut registry, "ws", "u1", WorkerState::Idle);
        add_worker(&mut registry, "ws", "u1", WorkerState::Idle);

        assert_eq!(registry.available_instance("ws"), Some(idle_one));
        assert_eq!(registry.available_instance("other"), None);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = WorkerRegistry::new();
        add_worker(&mut registry, "b", "u1", WorkerState::Idle);
        add_worker(&mut registry, "a", "u1", WorkerState::Idle);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].workspace_key, "a");
        assert_eq!(snapshot[1].workspace_key, "b");
    }
}
