// atomic.rs — Lock-free optimistic updates over the record store.
//
// The CAS loop: read the record and its version, apply the caller's
// update function, attempt a version-checked write. A VersionConflict
// means another writer landed first — re-read and try again, up to
// max_retries. Used for simple field updates (task claiming) that don't
// need a lock held across multi-step logic.

use fm_store::{Project, RecordStore, StoreError};
use thiserror::Error;

/// Outcome of an [`atomic_update`] that did not succeed.
#[derive(Debug, Error)]
pub enum UpdateError<E> {
    /// Every retry raced another writer. The caller's read-modify-write
    /// never got a consistent window.
    #[error("optimistic update on {id} exhausted after {attempts} conflicting attempts")]
    ConcurrencyExhausted { id: String, attempts: u32 },

    /// The store failed for a reason other than a version conflict.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The update function refused the current record state.
    #[error("update rejected: {0}")]
    Rejected(E),
}

/// Read-modify-write `id` with optimistic concurrency.
///
/// `update` receives the freshly-read record and returns the record to
/// persist, or an `E` to abort (surfaced as [`UpdateError::Rejected`]
/// without retrying — a rejection is a decision, not a race).
/// `max_retries` bounds how many `VersionConflict`s are absorbed before
/// giving up with [`UpdateError::ConcurrencyExhausted`].
pub fn atomic_update<F, E>(
    store: &RecordStore,
    id: &str,
    max_retries: u32,
    mut update: F,
) -> Result<Project, UpdateError<E>>
where
    F: FnMut(Project) -> Result<Project, E>,
{
    let mut conflicts = 0;
    loop {
        let (current, version) = store.read(id)?;
        let updated = update(current).map_err(UpdateError::Rejected)?;

        match store.write(id, &updated, version) {
            Ok(persisted) => return Ok(persisted),
            Err(StoreError::VersionConflict { .. }) => {
                conflicts += 1;
                if conflicts > max_retries {
                    return Err(UpdateError::ConcurrencyExhausted {
                        id: id.to_string(),
                        attempts: conflicts,
                    });
                }
                tracing::debug!(id, conflicts, "optimistic write raced, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }
}
