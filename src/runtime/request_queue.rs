// src/runtime/request_queue.rs
//! Per-workspace FIFO for requests waiting on a worker slot
//!
//! ```text
//! RequestQueue
//! ├─ "site-a": [r3, r7, r8]   (dispatched strictly front-first)
//! ├─ "site-b": [r5]
//! └─ ...
//! ```
//!
//! A queued caller keeps its payload and message sink; the entry only holds
//! what admission needs plus a one-shot handle through which the pool hands
//! over the slot it reserved.

use crate::runtime::worker::InstanceKey;
use crate::utils::errors::PoolError;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Slot handed to a queued request
#[derive(Debug)]
pub enum Assignment {
    /// An available instance, already marked busy for this request
    Reuse(InstanceKey),
    /// A reserved `spawning` instance the caller must start
    Spawn { key: InstanceKey, generation: u64 },
    /// Removed without dispatch (pool shutting down, workspace retired)
    Rejected(PoolError),
}

#[derive(Debug)]
pub struct QueueEntry {
    pub request_id: String,
    pub owner_key: String,
    pub workspace_key: String,
    pub workload_class: String,
    pub enqueued_at_ms: u64,
    seq: u64,
    notify: oneshot::Sender<Assignment>,
}

impl QueueEntry {
    pub fn new(
        request_id: impl Into<String>,
        owner_key: impl Into<String>,
        workspace_key: impl Into<String>,
        workload_class: impl Into<String>,
        enqueued_at_ms: u64,
    ) -> (Self, oneshot::Receiver<Assignment>) {
        let (notify, receiver) = oneshot::channel();
        let entry = Self {
            request_id: request_id.into(),
            owner_key: owner_key.into(),
            workspace_key: workspace_key.into(),
            workload_class: workload_class.into(),
            enqueued_at_ms,
            seq: 0,
            notify,
        };
        (entry, receiver)
    }

    /// Hand the slot to the waiting caller. Gives the assignment back if the
    /// caller has gone away so the reservation can be undone.
    pub fn assign(self, assignment: Assignment) -> std::result::Result<(), Assignment> {
        self.notify.send(assignment)
    }
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    next_seq: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut entry: QueueEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.queues
            .entry(entry.workspace_key.clone())
            .or_default()
            .push_back(entry);
    }

    /// Remove a still-queued request (cancellation)
    pub fn remove(&mut self, request_id: &str) -> Option<QueueEntry> {
        let workspace = self
            .queues
            .iter()
            .find(|(_, queue)| queue.iter().any(|e| e.request_id == request_id))
            .map(|(workspace, _)| workspace.clone())?;

        let queue = self.queues.get_mut(&workspace)?;
        let position = queue.iter().position(|e| e.request_id == request_id)?;
        let entry = queue.remove(position);
        if queue.is_empty() {
            self.queues.remove(&workspace);
        }
        entry
    }

    pub fn front(&self, workspace: &str) -> Option<&QueueEntry> {
        self.queues.get(workspace).and_then(VecDeque::front)
    }

    pub fn pop_front(&mut self, workspace: &str) -> Option<QueueEntry> {
        let queue = self.queues.get_mut(workspace)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(workspace);
        }
        entry
    }

    /// Workspaces with waiting requests, ordered by when their head arrived
    pub fn workspaces_by_arrival(&self) -> Vec<String> {
        let mut heads: Vec<(u64, &String)> = self
            .queues
            .iter()
            .filter_map(|(workspace, queue)| queue.front().map(|e| (e.seq, workspace)))
            .collect();
        heads.sort();
        heads.into_iter().map(|(_, workspace)| workspace.clone()).collect()
    }

    /// Take every entry of one workspace, in order
    pub fn drain_workspace(&mut self, workspace: &str) -> Vec<QueueEntry> {
        self.queues
            .remove(workspace)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Take every entry, in arrival order
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .queues
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queued_for_owner(&self, owner: &str) -> usize {
        self.queues
            .values()
            .flatten()
            .filter(|e| e.owner_key == owner)
            .count()
    }

    pub fn queued_for_workspace(&self, workspace: &str) -> usize {
        self.queues.get(workspace).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, owner: &str, workspace: &str) -> QueueEntry {
        QueueEntry::new(id, owner, workspace, "interactive", 0).0
    }

    #[test]
    fn test_fifo_per_workspace() {
        let mut queue = RequestQueue::new();
        queue.push(entry("r1", "u1", "ws"));
        queue.push(entry("r2", "u2", "ws"));
        queue.push(entry("r3", "u1", "ws"));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_front("ws"))
            .map(|e| e.request_id)
            .collect();
        assert_eq!(order, vec!["r1", "r2", "r3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_counts() {
        let mut queue = RequestQueue::new();
        queue.push(entry("r1", "u1", "a"));
        queue.push(entry("r2", "u1", "b"));
        queue.push(entry("r3", "u2", "a"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.queued_for_owner("u1"), 2);
        assert_eq!(queue.queued_for_workspace("a"), 2);
        assert_eq!(queue.queued_for_workspace("c"), 0);

        queue.pop_front("a");
        assert_eq!(queue.queued_for_owner("u1"), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let mut queue = RequestQueue::new();
        queue.push(entry("r1", "u1", "ws"));
        queue.push(entry("r2", "u1", "ws"));

        assert_eq!(queue.remove("r1").map(|e| e.request_id), Some("r1".into()));
        assert!(queue.remove("r1").is_none());
        assert_eq!(queue.front("ws").map(|e| e.request_id.as_str()), Some("r2"));
    }

    #[test]
    fn test_workspaces_by_arrival() {
        let mut queue = RequestQueue::new();
        queue.push(entry("r1", "u1", "b"));
        queue.push(entry("r2", "u1", "a"));
        queue.push(entry("r3", "u1", "b"));
        assert_eq!(queue.workspaces_by_arrival(), vec!["b", "a"]);

        queue.pop_front("b");
        assert_eq!(queue.workspaces_by_arrival(), vec!["a", "b"]);
    }

    #[test]
    fn test_drain_all_in_arrival_order() {
        let mut queue = RequestQueue::new();
        queue.push(entry("r1", "u1", "b"));
        queue.push(entry("r2", "u1", "a"));
        queue.push(entry("r3", "u1", "b"));

        let ids: Vec<String> = queue.drain_all().into_iter().map(|e| e.request_id).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_assignment_reaches_waiter() {
        let (entry, receiver) = QueueEntry::new("r1", "u1", "ws", "scheduled", 0);
        entry.assign(Assignment::Reuse(InstanceKey::new("ws", 0))).unwrap();
        assert!(matches!(receiver.await.unwrap(), Assignment::Reuse(key) if key.index() == 0));
    }

    #[test]
    fn test_assignment_returned_when_waiter_gone() {
        let (entry, receiver) = QueueEntry::new("r1", "u1", "ws", "scheduled", 0);
        drop(receiver);
        let returned = entry.assign(Assignment::Spawn {
            key: InstanceKey::new("ws", 1),
            generation: 7,
        });
        assert!(matches!(returned, Err(Assignment::Spawn { generation: 7, .. })));
    }
}
