// src/utils/config.rs
//! Pool configuration
//!
//! `PoolConfig` is immutable once a pool is built from it. Two validation
//! paths exist:
//!
//! - [`PoolConfig::validate`] for a typed config built in code
//! - [`PoolConfig::from_value`] for untyped overrides (JSON, config files,
//!   environment), which checks every field's shape before deserializing so
//!   that errors name the field instead of surfacing a serde message
//!
//! Layered loading (file + `WORKER_POOL__*` environment) goes through the
//! `config` crate and ends in `from_value`.

use crate::utils::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Integer fields that must be strictly positive
const POSITIVE_INT_FIELDS: &[&str] = &[
    "max_workers",
    "ready_timeout_ms",
    "shutdown_timeout_ms",
    "cancel_timeout_ms",
    "max_workers_per_user",
    "max_workers_per_workspace",
    "max_queued_per_user",
    "max_queued_per_workspace",
    "max_queued_global",
    "kill_grace_ms",
    "orphan_sweep_interval_ms",
    "orphan_max_age_ms",
    "eviction_interval_ms",
];

/// Integer fields where 0 disables the feature
const ZEROABLE_INT_FIELDS: &[&str] = &["inactivity_timeout_ms", "max_age_ms"];

/// Environment prefix for layered loading (`WORKER_POOL__MAX_WORKERS=8`)
pub const ENV_PREFIX: &str = "WORKER_POOL";

/// Which idle worker to retire when capacity is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Least recently active
    #[default]
    Lru,
    /// Earliest spawned
    Oldest,
    /// Fewest requests served (ties: earliest spawned)
    LeastUsed,
}

impl EvictionStrategy {
    pub const ALL: [EvictionStrategy; 3] = [
        EvictionStrategy::Lru,
        EvictionStrategy::Oldest,
        EvictionStrategy::LeastUsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Oldest => "oldest",
            EvictionStrategy::LeastUsed => "least_used",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        EvictionStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                PoolError::InvalidConfig(format!(
                    "Invalid eviction_strategy: {:?} (must be one of lru, oldest, least_used)",
                    s
                ))
            })
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Static ceiling on live workers (default: 20)
    pub max_workers: usize,

    /// Retire idle workers after this long without activity; 0 disables
    pub inactivity_timeout_ms: u64,

    /// Retire idle workers older than this; 0 disables
    pub max_age_ms: u64,

    /// Victim selection when capacity is needed
    pub eviction_strategy: EvictionStrategy,

    /// Worker executable
    pub worker_entry_path: PathBuf,

    /// Extra arguments placed before `--socket <path>`
    pub worker_args: Vec<String>,

    /// Directory holding worker sockets and pid files
    pub socket_dir: PathBuf,

    /// Deadline for the `ready` line after spawn
    pub ready_timeout_ms: u64,

    /// Wait for a graceful exit before force-terminating
    pub shutdown_timeout_ms: u64,

    /// Wait for a cancel acknowledgement before retiring the worker
    pub cancel_timeout_ms: u64,

    /// Active workers attributable to one owner
    pub max_workers_per_user: usize,

    /// Live instances for one workspace
    pub max_workers_per_workspace: usize,

    pub max_queued_per_user: usize,
    pub max_queued_per_workspace: usize,
    pub max_queued_global: usize,

    /// Scales the dynamic ceiling with host cores
    pub workers_per_core: f64,

    /// Host load fraction (0, 1] above which new spawns are refused
    pub load_shed_threshold: f64,

    /// Wait after SIGKILL before giving up on a process
    pub kill_grace_ms: u64,

    pub orphan_sweep_interval_ms: u64,

    /// Orphans younger than this are left alone
    pub orphan_max_age_ms: u64,

    /// Cadence of the eviction timer
    pub eviction_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            inactivity_timeout_ms: 15 * 60 * 1000,
            max_age_ms: 60 * 60 * 1000,
            eviction_strategy: EvictionStrategy::Lru,
            worker_entry_path: PathBuf::from("agent-worker"),
            worker_args: vec![],
            socket_dir: std::env::temp_dir().join("worker-pool"),
            ready_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            cancel_timeout_ms: 5_000,
            max_workers_per_user: 3,
            max_workers_per_workspace: 2,
            max_queued_per_user: 5,
            max_queued_per_workspace: 10,
            max_queued_global: 50,
            workers_per_core: 1.5,
            load_shed_threshold: 0.9,
            kill_grace_ms: 2_000,
            orphan_sweep_interval_ms: 60_000,
            orphan_max_age_ms: 5 * 60 * 1000,
            eviction_interval_ms: 30_000,
        }
    }
}

fn invalid(field: &str, value: impl fmt::Display, rule: &str) -> PoolError {
    PoolError::InvalidConfig(format!("Invalid {}: {} ({})", field, value, rule))
}

impl PoolConfig {
    /// Validate a typed config
    pub fn validate(&self) -> Result<()> {
        let positive: [(&str, u64); 13] = [
            ("max_workers", self.max_workers as u64),
            ("ready_timeout_ms", self.ready_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("cancel_timeout_ms", self.cancel_timeout_ms),
            ("max_workers_per_user", self.max_workers_per_user as u64),
            ("max_workers_per_workspace", self.max_workers_per_workspace as u64),
            ("max_queued_per_user", self.max_queued_per_user as u64),
            ("max_queued_per_workspace", self.max_queued_per_workspace as u64),
            ("max_queued_global", self.max_queued_global as u64),
            ("kill_grace_ms", self.kill_grace_ms),
            ("orphan_sweep_interval_ms", self.orphan_sweep_interval_ms),
            ("orphan_max_age_ms", self.orphan_max_age_ms),
            ("eviction_interval_ms", self.eviction_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, value, "must be positive integer"));
            }
        }

        if !(self.workers_per_core.is_finite() && self.workers_per_core > 0.0) {
            return Err(invalid(
                "workers_per_core",
                self.workers_per_core,
                "must be positive number",
            ));
        }
        if !(self.load_shed_threshold > 0.0 && self.load_shed_threshold <= 1.0) {
            return Err(invalid(
                "load_shed_threshold",
                self.load_shed_threshold,
                "must be in (0, 1]",
            ));
        }
        if self.worker_entry_path.as_os_str().is_empty() {
            return Err(invalid("worker_entry_path", "\"\"", "must be non-empty path"));
        }
        if self.socket_dir.as_os_str().is_empty() {
            return Err(invalid("socket_dir", "\"\"", "must be non-empty path"));
        }

        Ok(())
    }

    /// Build a config from untyped overrides on top of the defaults
    pub fn from_value(overrides: &Value) -> Result<Self> {
        let fields = match overrides {
            Value::Null => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Value::Object(fields) => fields,
            other => {
                return Err(PoolError::InvalidConfig(format!(
                    "Invalid config: expected an object, got {}",
                    other
                )))
            }
        };

        for (field, value) in fields {
            check_field(field, value)?;
        }

        let config: PoolConfig = serde_json::from_value(overrides.clone())
            .map_err(|e| PoolError::InvalidConfig(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional config file and `WORKER_POOL__*` environment
    /// variables over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PoolError::InvalidConfig(format!("Failed to load config: {}", e)))?;

        let value: Value = settings
            .try_deserialize()
            .map_err(|e| PoolError::InvalidConfig(format!("Failed to read config: {}", e)))?;

        Self::from_value(&value)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.orphan_sweep_interval_ms)
    }
}

fn check_field(field: &str, value: &Value) -> Result<()> {
    if POSITIVE_INT_FIELDS.contains(&field) {
        return match value.as_u64() {
            Some(n) if n > 0 => Ok(()),
            _ => Err(invalid(field, value, "must be positive integer")),
        };
    }
    if ZEROABLE_INT_FIELDS.contains(&field) {
        return match value.as_u64() {
            Some(_) => Ok(()),
            None => Err(invalid(field, value, "must be non-negative integer")),
        };
    }

    match field {
        "workers_per_core" => match value.as_f64() {
            Some(v) if v.is_finite() && v > 0.0 => Ok(()),
            _ => Err(invalid(field, value, "must be positive number")),
        },
        "load_shed_threshold" => match value.as_f64() {
            Some(v) if v > 0.0 && v <= 1.0 => Ok(()),
            _ => Err(invalid(field, value, "must be in (0, 1]")),
        },
        "eviction_strategy" => match value.as_str() {
            Some(s) => s.parse::<EvictionStrategy>().map(|_| ()),
            None => Err(invalid(
                field,
                value,
                "must be one of lru, oldest, least_used",
            )),
        },
        "worker_entry_path" | "socket_dir" => match value.as_str() {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err(invalid(field, value, "must be non-empty path")),
        },
        "worker_args" => match value.as_array() {
            Some(args) if args.iter().all(Value::is_string) => Ok(()),
            _ => Err(invalid(field, value, "must be a list of strings")),
        },
        _ => Err(PoolError::InvalidConfig(format!(
            "Unknown config field: {}",
            field
        ))),
    }
}
