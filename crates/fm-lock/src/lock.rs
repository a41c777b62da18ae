// lock.rs — LockCoordinator: exclusive lock files per project id.
//
// A lock is a file at `<lock_dir>/<project_id>.lock`, created with
// create_new (O_EXCL) so exactly one creator wins even across OS
// processes. The file body records who holds it and since when; release
// deletes the file. Locks are advisory — the record store never checks
// them — and exist only to serialize engine transitions on one project.
//
// Crashed holders leave their lock file behind. Any lock older than the
// configured stale age is treated as abandoned and broken, with the dead
// holder's identity logged.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LockError;

/// Tuning knobs for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// First backoff delay after a failed acquisition attempt.
    pub backoff_base: Duration,

    /// Upper bound on the (doubling) backoff delay.
    pub backoff_cap: Duration,

    /// Locks older than this are considered abandoned by a crashed
    /// holder and broken. Must comfortably exceed any single transition.
    pub stale_age: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(500),
            stale_age: Duration::from_secs(30),
        }
    }
}

/// The body of a lock file: holder identity and acquisition time.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    token: Uuid,
    acquired_at: DateTime<Utc>,
}

/// An exclusive lock on one project id.
///
/// Releases on drop, so a panicking transition cannot strand the lock
/// for its full stale age. Prefer [`LockCoordinator::release`] (or
/// [`LockCoordinator::with_lock`]) on the happy path so release errors
/// are observable.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    token: Uuid,
    released: bool,
}

impl LockHandle {
    /// Delete the lock file, but only if it is still ours — a stale
    /// break may have handed the lock to someone else in the meantime.
    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let ours = serde_json::from_str::<LockRecord>(&raw)
                    .map(|record| record.token == self.token)
                    .unwrap_or(false);
                if !ours {
                    tracing::warn!(path = %self.path.display(), "lock no longer ours at release");
                    return Ok(());
                }
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(LockError::IoError {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        fs::remove_file(&self.path).map_err(|source| LockError::IoError {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            tracing::warn!(%err, "failed to release lock on drop");
        }
    }
}

/// Coordinates exclusive access to projects via lock files.
pub struct LockCoordinator {
    lock_dir: PathBuf,
    holder: String,
    config: LockConfig,
}

impl LockCoordinator {
    /// Create a coordinator writing lock files under `lock_dir`,
    /// creating the directory if needed. `holder` identifies this
    /// process in lock records (useful when diagnosing stale locks).
    pub fn new(
        lock_dir: impl AsRef<Path>,
        holder: impl Into<String>,
        config: LockConfig,
    ) -> Result<Self, LockError> {
        let lock_dir = lock_dir.as_ref().to_path_buf();
        fs::create_dir_all(&lock_dir).map_err(|source| LockError::IoError {
            path: lock_dir.clone(),
            source,
        })?;
        Ok(Self {
            lock_dir,
            holder: holder.into(),
            config,
        })
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", id))
    }

    /// Acquire the lock for `id`, retrying with exponential backoff
    /// until `timeout` elapses.
    pub fn acquire(&self, id: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        let path = self.lock_path(id);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut delay = self.config.backoff_base;

        loop {
            match self.try_acquire(&path) {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {}
                Err(err) => return Err(err),
            }

            if self.break_if_stale(&path)? {
                // Abandoned lock removed — retry immediately.
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    id: id.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            std::thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(self.config.backoff_cap);
        }
    }

    /// Release a lock, surfacing any error (unlike the drop path).
    pub fn release(&self, mut handle: LockHandle) -> Result<(), LockError> {
        handle.release_inner()
    }

    /// Run `f` while holding the lock for `id`. The lock is released on
    /// every exit path, including panics, via the handle's drop.
    pub fn with_lock<T, E, F>(&self, id: &str, timeout: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        let handle = self.acquire(id, timeout)?;
        let result = f();
        self.release(handle)?;
        result
    }

    /// One create_new attempt. `Ok(None)` means somebody else holds it.
    fn try_acquire(&self, path: &Path) -> Result<Option<LockHandle>, LockError> {
        let token = Uuid::new_v4();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => {
                return Err(LockError::IoError {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let record = LockRecord {
            holder: self.holder.clone(),
            token,
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| LockError::IoError {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Some(LockHandle {
            path: path.to_path_buf(),
            token,
            released: false,
        }))
    }

    /// Break the lock if its holder looks dead. Returns true if broken.
    fn break_if_stale(&self, path: &Path) -> Result<bool, LockError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            // Holder released between our attempt and this check.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(LockError::IoError {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let age = match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) => (Utc::now() - record.acquired_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
            // Unparseable body: the creator crashed mid-write. Fall back
            // to the file's mtime.
            Err(_) => fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .unwrap_or(Duration::ZERO),
        };

        if age < self.config.stale_age {
            return Ok(false);
        }

        let holder = serde_json::from_str::<LockRecord>(&raw)
            .map(|record| record.holder)
            .unwrap_or_else(|_| "<unparseable>".to_string());
        tracing::warn!(
            path = %path.display(),
            %holder,
            age_secs = age.as_secs(),
            "breaking stale lock"
        );
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            // Lost the race to another breaker — that's fine.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(source) => Err(LockError::IoError {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
