// error.rs — The engine-boundary error taxonomy.
//
// Callers of the engine (the service layer, the CLI, the notifier) see
// exactly these kinds. Store, lock, and graph errors pass through
// transparently so NotFound/Corrupt/VersionConflict/LockTimeout/
// CycleDetected keep their identity across the boundary.

use fm_graph::GraphError;
use fm_lock::{LockError, UpdateError};
use fm_store::{ProjectState, StoreError, TaskState};
use thiserror::Error;

/// Errors surfaced by the state machine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Record store failure (NotFound, Corrupt, VersionConflict, I/O).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lock coordination failure (timeout, I/O).
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Dependency graph failure (cycle, self/unknown dependency).
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The optimistic path retried its bound and never won a write.
    #[error("optimistic update on project {id} exhausted after {attempts} attempts")]
    ConcurrencyExhausted { id: String, attempts: u32 },

    /// The caller's assumed current state is stale: the record moved
    /// underneath them.
    #[error("state mismatch on project {id}: expected {expected}, found {actual}")]
    StateMismatch {
        id: String,
        expected: ProjectState,
        actual: ProjectState,
    },

    /// The requested transition is not in the allowed table (and the
    /// caller did not force it), or a transition guard refused it.
    #[error("invalid transition {from} -> {to} for project {id}: {reason}")]
    InvalidTransition {
        id: String,
        from: ProjectState,
        to: ProjectState,
        reason: String,
    },

    /// The requested task-level change is not in the allowed table.
    #[error("invalid task transition {from} -> {to} for task {task_id} in project {project_id}")]
    InvalidTaskTransition {
        project_id: String,
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    /// Another worker already holds the card.
    #[error("task {task_id} in project {project_id} is already claimed by {assignee}")]
    AlreadyClaimed {
        project_id: String,
        task_id: String,
        assignee: String,
    },

    /// The card cannot be claimed while its dependencies are incomplete.
    #[error("task {task_id} in project {project_id} is not claimable: {reason}")]
    DependencyUnmet {
        project_id: String,
        task_id: String,
        reason: String,
    },

    /// No such card in the project.
    #[error("task {task_id} not found in project {project_id}")]
    TaskNotFound {
        project_id: String,
        task_id: String,
    },

    /// An event sink failed (non-fatal; logged by the dispatcher).
    #[error("event sink error: {0}")]
    SinkError(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    ConfigError(String),
}

impl From<UpdateError<EngineError>> for EngineError {
    fn from(err: UpdateError<EngineError>) -> Self {
        match err {
            UpdateError::ConcurrencyExhausted { id, attempts } => {
                EngineError::ConcurrencyExhausted { id, attempts }
            }
            UpdateError::Store(inner) => inner.into(),
            UpdateError::Rejected(inner) => inner,
        }
    }
}
