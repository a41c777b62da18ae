// config.rs — Engine configuration.
//
// EngineConfig pins down the board layout (bucket tree, lock directory,
// event feed) and the concurrency tuning (lock timeout, backoff, CAS
// retry ceiling, debounce window). `for_root()` gives the standard
// layout; `load()` reads a foreman.toml for deployments that tune it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fm_lock::LockConfig;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Configuration for the state machine and change notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Board root: the bucket directories live directly under it.
    pub board_root: PathBuf,

    /// Directory for per-project lock files.
    pub lock_dir: PathBuf,

    /// Path of the JSONL change event feed.
    pub events_log: PathBuf,

    /// How long a transition may wait on a project lock.
    #[serde(default = "defaults::lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// First backoff delay for lock acquisition retries.
    #[serde(default = "defaults::backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the doubling backoff delay.
    #[serde(default = "defaults::backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Age past which an abandoned lock file is broken.
    #[serde(default = "defaults::stale_lock_age_ms")]
    pub stale_lock_age_ms: u64,

    /// How many version conflicts the optimistic path absorbs.
    #[serde(default = "defaults::max_cas_retries")]
    pub max_cas_retries: u32,

    /// Stability window for coalescing rapid file-change signals.
    #[serde(default = "defaults::debounce_window_ms")]
    pub debounce_window_ms: u64,
}

mod defaults {
    pub fn lock_timeout_ms() -> u64 {
        5_000
    }
    pub fn backoff_base_ms() -> u64 {
        10
    }
    pub fn backoff_cap_ms() -> u64 {
        500
    }
    pub fn stale_lock_age_ms() -> u64 {
        30_000
    }
    pub fn max_cas_retries() -> u32 {
        5
    }
    pub fn debounce_window_ms() -> u64 {
        200
    }
}

impl EngineConfig {
    /// Standard layout: buckets under the root, locks in `.locks`,
    /// events in `events.jsonl`.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            lock_dir: root.join(".locks"),
            events_log: root.join("events.jsonl"),
            board_root: root,
            lock_timeout_ms: defaults::lock_timeout_ms(),
            backoff_base_ms: defaults::backoff_base_ms(),
            backoff_cap_ms: defaults::backoff_cap_ms(),
            stale_lock_age_ms: defaults::stale_lock_age_ms(),
            max_cas_retries: defaults::max_cas_retries(),
            debounce_window_ms: defaults::debounce_window_ms(),
        }
    }

    /// Load a config from a `foreman.toml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            EngineError::ConfigError(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        toml::from_str(&raw).map_err(|err| EngineError::ConfigError(err.to_string()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    /// The lock coordinator tuning derived from this config.
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            stale_age: Duration::from_millis(self.stale_lock_age_ms),
        }
    }
}
