//! Runtime configuration: slot-manager/pool policy, shuffle defaults and
//! checkpoint defaults, loaded from TOML with a `clap`-derived CLI surface.

use std::env;
use std::path::Path;
use std::time::Duration;

#[cfg(feature = "clap")]
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::graph::physical::RetentionPolicy;
use crate::ids::CoordUInt;

/// Environment variable carrying the same TOML text as the config file, so
/// worker processes that cannot read the control plane's filesystem still
/// get their config.
pub const CONFIG_ENV_VAR: &str = "STREAMRT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlotManagerConfig {
    pub max_slots: CoordUInt,
    pub redundant_worker_num: CoordUInt,
    pub worker_timeout_secs: u64,
    pub slot_request_timeout_secs: u64,
}

impl Default for SlotManagerConfig {
    fn default() -> Self {
        Self {
            max_slots: 1024,
            redundant_worker_num: 1,
            worker_timeout_secs: 600,
            slot_request_timeout_secs: 300,
        }
    }
}

impl SlotManagerConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn slot_request_timeout(&self) -> Duration {
        Duration::from_secs(self.slot_request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlotPoolConfig {
    pub idle_timeout_secs: u64,
    pub batch_request_timeout_secs: u64,
}

impl Default for SlotPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            batch_request_timeout_secs: 3600,
        }
    }
}

impl SlotPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn batch_request_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShuffleConfig {
    pub exclusive_buffers_per_channel: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Total deliveries the backoff schedule hands out (including the
    /// repeats once `max_backoff_ms` is reached) before a
    /// `partition-not-found` retry gives up for good.
    pub max_backoff_attempts: u32,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            exclusive_buffers_per_channel: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            max_backoff_attempts: 10,
        }
    }
}

impl ShuffleConfig {
    pub fn backoff_schedule(&self) -> crate::shuffle::BackoffSchedule {
        crate::shuffle::BackoffSchedule::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.max_backoff_attempts,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointDefaults {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub alignment_timeout_ms: u64,
    pub retention: RetentionPolicy,
}

impl Default for CheckpointDefaults {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 600_000,
            alignment_timeout_ms: 0,
            retention: RetentionPolicy::DeleteOnCancellation,
        }
    }
}

/// Whole-cluster configuration: everything the slot manager, every job's
/// slot pool, the shuffle input path and the checkpoint coordinator need
/// by default.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub slot_manager: SlotManagerConfig,
    pub slot_pool: SlotPoolConfig,
    pub shuffle: ShuffleConfig,
    pub checkpoint: CheckpointDefaults,
}

impl RuntimeConfig {
    /// Reads the config from `path`. This is how the control plane process
    /// (the one with filesystem access to the config file) loads it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reads the config from the `STREAMRT_CONFIG` environment variable, for
    /// worker processes spawned without access to the original file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let content = env::var(CONFIG_ENV_VAR)
            .map_err(|e| ConfigError::Environment(CONFIG_ENV_VAR.to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_manager.max_slots == 0 {
            return Err(ConfigError::Invalid("max_slots must be positive".into()));
        }
        Ok(())
    }

    /// Loads from the environment variable if set (worker process), else
    /// from `path` (control plane process) — mirroring
    /// `renoir::RuntimeConfig::remote`'s env-vs-file fallback.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if env::var(CONFIG_ENV_VAR).is_ok() {
            Self::from_env()
        } else {
            Self::from_file(path)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing environment variable {0}: {1}")]
    Environment(String, env::VarError),
}

/// Launches/terminates worker processes on behalf of the slot manager's
/// rescaling policy. The concrete implementation (SSH,
/// container orchestration, a cloud API) is the out-of-scope "cluster
/// resource provider" collaborator; this crate only defines the
/// seam.
pub trait ResourceActions: Send + Sync {
    fn launch_worker(&self, slots_per_worker: CoordUInt);
    fn release_worker(&self, worker: crate::ids::WorkerId);
}

#[cfg(feature = "clap")]
#[derive(Debug, Parser)]
#[clap(name = "streamrt", about = "Task-execution runtime core")]
pub struct CommandLineOptions {
    /// Path to the runtime configuration TOML file.
    #[clap(short, long, default_value = "streamrt.toml")]
    pub config: std::path::PathBuf,

    /// Override `slot_manager.redundant_worker_num`.
    #[clap(long)]
    pub redundant_workers: Option<CoordUInt>,

    /// Override `slot_manager.slot_request_timeout_secs`.
    #[clap(long)]
    pub slot_request_timeout: Option<u64>,
}

#[cfg(feature = "clap")]
impl CommandLineOptions {
    pub fn load_config(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = RuntimeConfig::load(&self.config)?;
        if let Some(n) = self.redundant_workers {
            config.slot_manager.redundant_worker_num = n;
        }
        if let Some(secs) = self.slot_request_timeout {
            config.slot_manager.slot_request_timeout_secs = secs;
        }
        Ok(config)
    }
}
