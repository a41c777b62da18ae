// error.rs — Error types for the change notifier.

use thiserror::Error;

/// Errors that can occur while watching the board.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The underlying filesystem watcher failed. The notifier restarts
    /// the watch with backoff after surfacing this to its owner.
    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),

    /// The store could not be scanned while priming the notifier.
    #[error(transparent)]
    Store(#[from] fm_store::StoreError),

    /// `start()` was called while the watch thread is already running.
    #[error("notifier is already running")]
    AlreadyRunning,
}
