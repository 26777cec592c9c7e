//! Cascade configuration system.
//!
//! TOML file with serde defaults. Resolution order: explicit path →
//! `CASCADE_CONFIG` env var → `~/.cascade/config.toml` → built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CascadeError, Result};

/// Root configuration for the engine and its worker loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Directory holding the SQLite database and runtime state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Event-processing loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent event-processing workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Max events claimed per poll.
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: usize,
    /// Seconds before an unfinished claim becomes reclaimable.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Poll interval when the event store is empty.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Max delivery attempts for an event before it is left unprocessed.
    #[serde(default = "default_max_attempts")]
    pub event_max_attempts: u32,
}

/// Action dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of concurrent job-dispatching workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Max jobs claimed per poll.
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: usize,
    /// Seconds before a running job's claim expires.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Poll interval when the job queue is empty.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Hard timeout on a single action handler invocation.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// Default retry budget for newly enqueued jobs.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Ceiling on the retry delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

/// Schedule-trigger evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often due schedule rules are checked.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cascade")
}
fn default_workers() -> usize {
    2
}
fn default_claim_batch() -> usize {
    16
}
fn default_lease_secs() -> u64 {
    60
}
fn default_poll_secs() -> u64 {
    1
}
fn default_max_attempts() -> u32 {
    5
}
fn default_action_timeout() -> u64 {
    30
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_cap() -> u64 {
    3600
}
fn default_tick_secs() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            claim_batch_size: default_claim_batch(),
            lease_secs: default_lease_secs(),
            poll_secs: default_poll_secs(),
            event_max_attempts: default_max_attempts(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            claim_batch_size: default_claim_batch(),
            lease_secs: default_lease_secs(),
            poll_secs: default_poll_secs(),
            action_timeout_secs: default_action_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl CascadeConfig {
    /// Load config from `CASCADE_CONFIG` or the default path, falling back
    /// to built-in defaults when no file exists.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CASCADE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CascadeError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CascadeError::Config(format!("failed to parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Default config path (~/.cascade/config.toml).
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Path of the engine database under the data dir.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cascade.db")
    }
}
