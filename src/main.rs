// src/main.rs
//! Worker pool host
//!
//! Reads one JSON request per stdin line and runs each through the pool.
//! Streamed messages and outcomes are written to stdout as JSON lines tagged
//! with the request id; logs go to stderr.
//!
//! ```text
//! $ echo '{"credentials":{"uid":1000,"gid":1000,"cwd":"/srv/a","workspace_key":"a"},
//!          "owner_key":"u1","payload":{"prompt":"hi"}}' | worker-pool pool.toml
//! {"type":"message","request_id":"01H...","content":{...}}
//! {"type":"complete","request_id":"01H...","outcome":{...}}
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tenant_worker_pool::observability::{init_metrics, init_tracing};
use tenant_worker_pool::{
    get_pool, PoolConfig, PoolEvent, PoolManager, QueryOptions, QueryOutcome, WorkerCredentials,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Buffered output lines before request tasks wait on stdout
const OUTPUT_BUFFER: usize = 256;

/// Buffered streamed messages per request
const MESSAGE_BUFFER: usize = 64;

/// Per-tenant worker pool host reading JSON requests from stdin
#[derive(Parser, Debug)]
#[command(name = "worker-pool", version, about)]
struct Cli {
    /// Pool configuration file (TOML, YAML or JSON)
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct HostRequest {
    credentials: WorkerCredentials,
    #[serde(default)]
    request_id: Option<String>,
    owner_key: String,
    #[serde(default)]
    workload_class: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostOutput {
    Message {
        request_id: String,
        content: Value,
    },
    Complete {
        request_id: String,
        outcome: QueryOutcome,
    },
    Error {
        request_id: String,
        error: String,
        backpressure: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize observability (tracing, metrics, logging)
    init_tracing()?;
    init_metrics()?;

    info!("Starting worker pool host v{}", tenant_worker_pool::VERSION);

    // Load configuration
    let config = PoolConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!("Configuration loaded: {:?}", config);

    let pool = get_pool(Some(config))?;
    pool.start_eviction_timer();
    pool.start_orphan_sweeper();

    tokio::spawn(log_events(pool.subscribe()));

    let (output_tx, output_rx) = mpsc::channel::<HostOutput>(OUTPUT_BUFFER);
    let writer = tokio::spawn(write_output(output_rx));

    tokio::select! {
        result = read_requests(pool, output_tx) => {
            if let Err(e) = result {
                error!("Failed to read requests: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, cleaning up...");
        }
    }

    pool.stop_eviction_timer();
    pool.stop_orphan_sweeper();
    let retired = pool.shutdown_all().await;
    info!("Shutdown complete ({} workers retired)", retired);

    // Every sender is gone once the reader has returned
    if let Err(e) = writer.await {
        warn!("Output writer failed: {}", e);
    }
    Ok(())
}

/// Run every stdin request to completion; returns at EOF once in-flight
/// requests have settled
async fn read_requests(pool: &'static PoolManager, output: mpsc::Sender<HostOutput>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let request: HostRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping malformed request line: {}", e);
                continue;
            }
        };

        in_flight.spawn(run_request(pool, request, output.clone()));
    }

    debug!("Stdin closed; waiting for {} requests", in_flight.len());
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Request task failed: {}", e);
        }
    }
    Ok(())
}

async fn run_request(pool: &'static PoolManager, request: HostRequest, output: mpsc::Sender<HostOutput>) {
    let request_id = request
        .request_id
        .unwrap_or_else(|| ulid::Ulid::new().to_string());

    let (message_tx, mut message_rx) = mpsc::channel(MESSAGE_BUFFER);
    let mut options = QueryOptions::new(request_id.clone(), request.owner_key, request.payload)
        .on_message(message_tx);
    if let Some(class) = request.workload_class {
        options = options.workload_class(class);
    }

    let forward = {
        let output = output.clone();
        let request_id = request_id.clone();
        async move {
            while let Some(content) = message_rx.recv().await {
                let line = HostOutput::Message {
                    request_id: request_id.clone(),
                    content,
                };
                if output.send(line).await.is_err() {
                    break;
                }
            }
        }
    };

    let (result, ()) = tokio::join!(pool.query(request.credentials, options), forward);

    let line = match result {
        Ok(outcome) => HostOutput::Complete {
            request_id,
            outcome,
        },
        Err(e) => {
            if e.is_backpressure() {
                debug!("Request {} rejected: {}", request_id, e);
            } else {
                warn!("Request {} failed: {}", request_id, e);
            }
            HostOutput::Error {
                request_id,
                backpressure: e.is_backpressure(),
                error: e.to_string(),
            }
        }
    };
    let _ = output.send(line).await;
}

async fn write_output(mut output: mpsc::Receiver<HostOutput>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = output.recv().await {
        let mut encoded = match serde_json::to_vec(&line) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode output: {}", e);
                continue;
            }
        };
        encoded.push(b'\n');
        if let Err(e) = stdout.write_all(&encoded).await {
            error!("Failed to write to stdout: {}", e);
            return;
        }
        let _ = stdout.flush().await;
    }
}

async fn log_events(mut events: broadcast::Receiver<PoolEvent>) {
    loop {
        match events.recv().await {
            Ok(PoolEvent::PoolError {
                workspace_key,
                context,
                message,
            }) => warn!(?workspace_key, context = %context, "pool:error {}", message),
            Ok(event) => debug!(
                event = event.name(),
                workspace_key = event.workspace_key(),
                "pool event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagged, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
