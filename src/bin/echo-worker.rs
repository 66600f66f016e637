// src/bin/echo-worker.rs
//! Reference worker process
//!
//! Binds the socket given by `--socket`, prints `ready`, and echoes each
//! query back as a stream of messages followed by `complete`. The query
//! payload steers the behaviour:
//!
//! | field           | effect                                              |
//! |-----------------|-----------------------------------------------------|
//! | `chunks`        | number of `message` frames (default 1)              |
//! | `delay_ms`      | pause before each message (default 0)               |
//! | `ignore_cancel` | keep streaming after `cancel`                       |
//! | `fail`          | reply with `error{message: fail}` instead           |
//! | `crash`         | exit the process after the first message            |
//!
//! `--ready-delay-ms <n>` delays the ready line, `--exit-before-ready`
//! exits without ever signalling.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tenant_worker_pool::runtime::ipc::{Connection, PoolFrame, WorkerFrame};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Echo worker serving one workspace over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "echo-worker", version, about)]
struct Args {
    /// Socket to bind and serve the pool on
    #[arg(long)]
    socket: PathBuf,

    /// Delay before printing the ready line
    #[arg(long, default_value_t = 0)]
    ready_delay_ms: u64,

    /// Exit with an error before signalling ready
    #[arg(long)]
    exit_before_ready: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.exit_before_ready {
        bail!("exiting before ready as requested");
    }

    match std::fs::remove_file(&args.socket) {
        Ok(()) => debug!("Removed stale socket {:?}", args.socket),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Failed to remove stale socket"),
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("Failed to bind {:?}", args.socket))?;

    tokio::time::sleep(Duration::from_millis(args.ready_delay_ms)).await;
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "ready")?;
        stdout.flush()?;
    }
    info!("Echo worker {} listening on {:?}", std::process::id(), args.socket);

    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("Accept failed")?;
                let socket = args.socket.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, socket).await {
                        warn!("Connection failed: {}", e);
                    }
                });
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, exiting");
                let _ = std::fs::remove_file(&args.socket);
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, socket: PathBuf) -> Result<()> {
    let mut connection = Connection::new(stream);
    while let Some(frame) = connection.recv::<PoolFrame>().await? {
        match frame {
            PoolFrame::Query {
                request_id,
                payload,
                ..
            } => serve_turn(&mut connection, request_id, payload).await?,
            PoolFrame::Cancel { request_id } => {
                debug!("Cancel for {} with no turn in progress", request_id);
            }
            PoolFrame::Shutdown => {
                connection.send(&WorkerFrame::ShutdownAck).await?;
                info!("Shutdown requested, exiting");
                let _ = std::fs::remove_file(&socket);
                std::process::exit(0);
            }
        }
    }
    Ok(())
}

async fn serve_turn(connection: &mut Connection, request_id: String, payload: Value) -> Result<()> {
    let chunks = payload["chunks"].as_u64().unwrap_or(1);
    let delay = Duration::from_millis(payload["delay_ms"].as_u64().unwrap_or(0));
    let ignore_cancel = payload["ignore_cancel"].as_bool().unwrap_or(false);
    let crash = payload["crash"].as_bool().unwrap_or(false);

    for chunk in 0..chunks {
        let pause = tokio::time::sleep(delay);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                biased;
                _ = &mut pause => break,
                frame = connection.recv::<PoolFrame>() => match frame? {
                    Some(PoolFrame::Cancel { request_id: cancelled }) if cancelled == request_id => {
                        if ignore_cancel {
                            debug!("Ignoring cancel for {}", request_id);
                            continue;
                        }
                        connection.send(&WorkerFrame::Cancelled { request_id }).await?;
                        return Ok(());
                    }
                    Some(other) => debug!("Ignoring {:?} mid-turn", other),
                    None => return Ok(()),
                },
            }
        }

        let content = json!({
            "chunk": chunk,
            "prompt": payload.get("prompt").cloned().unwrap_or(Value::Null),
        });
        connection
            .send(&WorkerFrame::Message {
                request_id: request_id.clone(),
                content,
            })
            .await?;

        if crash {
            warn!("Crashing mid-turn as requested");
            std::process::exit(3);
        }
    }

    if let Some(message) = payload["fail"].as_str() {
        connection
            .send(&WorkerFrame::Error {
                request_id,
                message: message.to_string(),
            })
            .await?;
        return Ok(());
    }

    let result = json!({
        "pid": std::process::id(),
        "chunks": chunks,
        "echo": payload,
    });
    connection
        .send(&WorkerFrame::Complete {
            request_id,
            result: Some(result),
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args_as_spawned_by_pool() {
        let args = Args::try_parse_from([
            "echo-worker",
            "--ready-delay-ms",
            "250",
            "--socket",
            "/run/pool/site-a.sock",
        ])
        .unwrap();
        assert_eq!(args.socket, PathBuf::from("/run/pool/site-a.sock"));
        assert_eq!(args.ready_delay_ms, 250);
        assert!(!args.exit_before_ready);
    }

    #[test]
    fn test_socket_is_required() {
        assert!(Args::try_parse_from(["echo-worker", "--exit-before-ready"]).is_err());
    }

    #[test]
    fn test_invalid_ready_delay_rejected() {
        let parsed = Args::try_parse_from([
            "echo-worker",
            "--socket",
            "/tmp/w.sock",
            "--ready-delay-ms",
            "soon",
        ]);
        assert!(parsed.is_err());
    }
}
