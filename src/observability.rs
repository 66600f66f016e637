// src/observability.rs
//! Logging and metrics setup, plus the metric names the pool emits
//!
//! Logs always go to stderr; stdout belongs to the host binary's JSON-lines
//! output.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// `1` switches log output to JSON
pub const ENV_LOG_JSON: &str = "WORKER_POOL_LOG_JSON";

/// Listen address for the Prometheus scrape endpoint; unset disables it
pub const ENV_METRICS_ADDR: &str = "WORKER_POOL_METRICS_ADDR";

pub const WORKERS_SPAWNED: &str = "worker_pool_workers_spawned_total";
pub const SPAWN_FAILURES: &str = "worker_pool_spawn_failures_total";
/// Labelled by `reason`
pub const WORKERS_RETIRED: &str = "worker_pool_workers_retired_total";
/// Labelled by `decision`
pub const REQUESTS_ADMITTED: &str = "worker_pool_requests_admitted_total";
pub const REQUESTS_REJECTED: &str = "worker_pool_requests_rejected_total";
pub const ORPHANS_REAPED: &str = "worker_pool_orphans_reaped_total";

pub const WORKERS_TOTAL: &str = "worker_pool_workers";
pub const WORKERS_BUSY: &str = "worker_pool_workers_busy";
pub const WORKERS_IDLE: &str = "worker_pool_workers_idle";
pub const QUEUE_DEPTH: &str = "worker_pool_queue_depth";

/// Install the global tracing subscriber (`RUST_LOG`, default `info`)
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(ENV_LOG_JSON).map(|v| v == "1").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }
    Ok(())
}

/// Install the Prometheus recorder if a listen address is configured.
/// Without one, metric calls go to the no-op recorder.
pub fn init_metrics() -> Result<()> {
    let Ok(addr) = std::env::var(ENV_METRICS_ADDR) else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {}: {:?}", ENV_METRICS_ADDR, addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}
