// events.rs — Change events and subscriber dispatch.
//
// Every executed transition emits a ChangeEvent; the change notifier
// emits the same shape for validated external edits, tagged with cause
// `observed`. Subscribers are EventSinks: the service layer registers a
// callback to relay events to dashboard clients, and a JSONL sink keeps
// an on-disk feed that can be tailed.
//
// Sink failures are logged and never stop the engine or other sinks.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fm_store::{ProjectState, TaskState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// What triggered a change: an engine-executed transition, or an
/// externally-made file edit observed by the notifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    Transition,
    Observed,
}

/// A detected or executed state change on the board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A project moved between lifecycle states.
    ProjectStateChanged {
        event_id: Uuid,
        project_id: String,
        from_state: ProjectState,
        to_state: ProjectState,
        cause: ChangeCause,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A task card moved between lifecycle states.
    TaskStateChanged {
        event_id: Uuid,
        project_id: String,
        task_id: String,
        from_state: TaskState,
        to_state: TaskState,
        cause: ChangeCause,
        timestamp: DateTime<Utc>,
    },
}

impl ChangeEvent {
    /// Helper for a project-level event.
    pub fn project(
        project_id: &str,
        from: ProjectState,
        to: ProjectState,
        cause: ChangeCause,
        reason: Option<String>,
    ) -> Self {
        ChangeEvent::ProjectStateChanged {
            event_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            from_state: from,
            to_state: to,
            cause,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Helper for a task-level event.
    pub fn task(
        project_id: &str,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        cause: ChangeCause,
    ) -> Self {
        ChangeEvent::TaskStateChanged {
            event_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            from_state: from,
            to_state: to,
            cause,
            timestamp: Utc::now(),
        }
    }

    /// The project this event belongs to.
    pub fn project_id(&self) -> &str {
        match self {
            ChangeEvent::ProjectStateChanged { project_id, .. }
            | ChangeEvent::TaskStateChanged { project_id, .. } => project_id,
        }
    }

    /// The event type name as a string.
    pub fn event_type(&self) -> &str {
        match self {
            ChangeEvent::ProjectStateChanged { .. } => "project_state_changed",
            ChangeEvent::TaskStateChanged { .. } => "task_state_changed",
        }
    }

    pub fn cause(&self) -> ChangeCause {
        match self {
            ChangeEvent::ProjectStateChanged { cause, .. }
            | ChangeEvent::TaskStateChanged { cause, .. } => *cause,
        }
    }
}

/// Trait for receiving change events.
///
/// Implementations decide what to do with each event: append to a log,
/// push over a websocket, poke a dashboard. Errors are logged by the
/// dispatcher but don't stop the engine or other sinks.
pub trait EventSink: Send {
    fn send(&self, event: &ChangeEvent) -> Result<(), EngineError>;
}

/// Adapts a plain closure into an [`EventSink`].
pub struct CallbackSink<F>(pub F);

impl<F> EventSink for CallbackSink<F>
where
    F: Fn(&ChangeEvent) + Send,
{
    fn send(&self, event: &ChangeEvent) -> Result<(), EngineError> {
        (self.0)(event);
        Ok(())
    }
}

/// Appends events as JSONL to a file (the board's tailable feed).
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl EventSink for JsonlSink {
    fn send(&self, event: &ChangeEvent) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| EngineError::SinkError(err.to_string()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| EngineError::SinkError(err.to_string()))?;

        let json = serde_json::to_string(event)
            .map_err(|err| EngineError::SinkError(err.to_string()))?;
        writeln!(file, "{}", json).map_err(|err| EngineError::SinkError(err.to_string()))?;
        Ok(())
    }
}

/// Dispatches events to all subscribed sinks.
///
/// Interior-mutable so subscribers can be added after the dispatcher is
/// shared between the engine and the notifier.
pub struct EventDispatcher {
    sinks: Mutex<Vec<Box<dyn EventSink>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink for all future events.
    pub fn subscribe(&self, sink: Box<dyn EventSink>) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Dispatch an event to every sink; sink errors are logged only.
    pub fn dispatch(&self, event: &ChangeEvent) {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            if let Err(err) = sink.send(event) {
                tracing::warn!(%err, event_type = event.event_type(), "event sink error");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
