// src/runtime/events.rs
//! Pool lifecycle events with fan-out to every subscriber
//!
//! Events are published while the pool's state lock is held, so a worker's
//! events always arrive in lifecycle order (spawned → ready → busy → idle).

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per subscriber before a slow one starts lagging
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum PoolEvent {
    #[serde(rename = "worker:spawned", rename_all = "camelCase")]
    WorkerSpawned { workspace_key: String, pid: u32 },

    #[serde(rename = "worker:ready", rename_all = "camelCase")]
    WorkerReady { workspace_key: String, pid: u32 },

    #[serde(rename = "worker:busy", rename_all = "camelCase")]
    WorkerBusy {
        workspace_key: String,
        request_id: String,
    },

    #[serde(rename = "worker:idle", rename_all = "camelCase")]
    WorkerIdle { workspace_key: String },

    #[serde(rename = "pool:error", rename_all = "camelCase")]
    PoolError {
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace_key: Option<String>,
        context: String,
        message: String,
    },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::WorkerSpawned { .. } => "worker:spawned",
            PoolEvent::WorkerReady { .. } => "worker:ready",
            PoolEvent::WorkerBusy { .. } => "worker:busy",
            PoolEvent::WorkerIdle { .. } => "worker:idle",
            PoolEvent::PoolError { .. } => "pool:error",
        }
    }

    pub fn workspace_key(&self) -> Option<&str> {
        match self {
            PoolEvent::WorkerSpawned { workspace_key, .. }
            | PoolEvent::WorkerReady { workspace_key, .. }
            | PoolEvent::WorkerBusy { workspace_key, .. }
            | PoolEvent::WorkerIdle { workspace_key } => Some(workspace_key),
            PoolEvent::PoolError { workspace_key, .. } => workspace_key.as_deref(),
        }
    }
}

/// Publish/subscribe bus; each subscriber receives every event
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers; a bus with none is fine
    pub fn publish(&self, event: PoolEvent) {
        trace!("event {}", event.name());
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
