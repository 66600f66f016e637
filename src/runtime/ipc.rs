// src/runtime/ipc.rs
//! Pool ↔ worker IPC over a private Unix socket
//!
//! Frames are newline-delimited JSON objects tagged by `type`. One connection
//! carries one turn:
//!
//! ```text
//! pool                               worker
//!  │── query{request_id, payload} ──▶ │
//!  │◀── message{request_id, content} ─│  (0..n)
//!  │── cancel{request_id} ──────────▶ │  (optional)
//!  │◀── complete | error | cancelled ─│
//! ```
//!
//! Shutdown uses its own connection: `shutdown` → `shutdown_ack`.

use crate::utils::errors::{PoolError, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};

/// Upper bound on a single frame
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frames sent by the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolFrame {
    Query {
        request_id: String,
        workload_class: String,
        payload: Value,
    },
    Cancel {
        request_id: String,
    },
    Shutdown,
}

/// Frames sent by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Message {
        request_id: String,
        content: Value,
    },
    Complete {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        request_id: String,
        message: String,
    },
    Cancelled {
        request_id: String,
    },
    ShutdownAck,
}

/// A framed connection, used from both ends
pub struct Connection {
    framed: Framed<UnixStream, LinesCodec>,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
        }
    }

    /// Connect to a worker socket
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| PoolError::Ipc(format!("Connect to {:?} timed out", path)))?
            .map_err(|e| PoolError::Ipc(format!("Connect to {:?} failed: {}", path, e)))?;
        Ok(Self::new(stream))
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let line = serde_json::to_string(frame)?;
        self.framed
            .send(line)
            .await
            .map_err(|e| PoolError::Ipc(format!("Write failed: {}", e)))
    }

    /// Next frame; `None` once the peer has closed the connection.
    /// Cancel-safe, so it can sit in a `select!`.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return Ok(Some(serde_json::from_str(&line)?)),
                Some(Err(e)) => return Err(PoolError::Ipc(format!("Read failed: {}", e))),
            }
        }
    }
}

impl WorkerFrame {
    /// Request id the frame belongs to, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerFrame::Message { request_id, .. }
            | WorkerFrame::Complete { request_id, .. }
            | WorkerFrame::Error { request_id, .. }
            | WorkerFrame::Cancelled { request_id } => Some(request_id),
            WorkerFrame::ShutdownAck => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let frame = PoolFrame::Query {
            request_id: "r1".into(),
            workload_class: "interactive".into(),
            payload: json!({ "prompt": "hi" }),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "query");
        assert_eq!(value["request_id"], "r1");

        let ack: WorkerFrame = serde_json::from_str(r#"{"type":"shutdown_ack"}"#).unwrap();
        assert_eq!(ack, WorkerFrame::ShutdownAck);

        let done: WorkerFrame = serde_json::from_str(r#"{"type":"complete","request_id":"r1"}"#).unwrap();
        assert_eq!(done.request_id(), Some("r1"));
    }

    #[tokio::test]
    async fn test_exchange_over_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut pool = Connection::new(a);
        let mut worker = Connection::new(b);

        pool.send(&PoolFrame::Cancel { request_id: "r9".into() }).await.unwrap();
        let received: PoolFrame = worker.recv().await.unwrap().unwrap();
        assert_eq!(received, PoolFrame::Cancel { request_id: "r9".into() });

        worker
            .send(&WorkerFrame::Cancelled { request_id: "r9".into() })
            .await
            .unwrap();
        drop(worker);

        let reply: Option<WorkerFrame> = pool.recv().await.unwrap();
        assert_eq!(reply, Some(WorkerFrame::Cancelled { request_id: "r9".into() }));
        let eof: Option<WorkerFrame> = pool.recv().await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_ipc_error() {
        use tokio::io::AsyncWriteExt;

        let (a, mut b) = UnixStream::pair().unwrap();
        let mut pool = Connection::new(a);
        b.write_all(b"not json\n").await.unwrap();

        let result: Result<Option<WorkerFrame>> = pool.recv().await;
        assert!(matches!(result, Err(PoolError::Ipc(_))));
    }
}
