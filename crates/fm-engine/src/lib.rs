//! # fm-engine
//!
//! The Foreman state machine: the single validated write path for every
//! board mutation.
//!
//! All mutations — worker claims, task completion, project transitions,
//! and externally-made file edits absorbed through the change notifier —
//! funnel through [`StateMachine`], which acquires the project lock (or
//! runs the optimistic path), validates the transition against the fixed
//! table and its per-pair guards, writes atomically with a version
//! check, relocates the lifecycle bucket, and emits a [`ChangeEvent`].
//!
//! ## Key components
//!
//! - [`StateMachine`] — validated transitions, claiming, task
//!   completion/failure, external-edit absorption.
//! - [`ChangeEvent`] / [`EventDispatcher`] / [`EventSink`] — change
//!   notification to subscribers (callbacks, JSONL log).
//! - [`EngineConfig`] — board layout and concurrency tuning, loadable
//!   from `foreman.toml`.

pub mod config;
pub mod error;
pub mod events;
pub mod machine;

pub use config::EngineConfig;
pub use error::EngineError;
pub use events::{CallbackSink, ChangeCause, ChangeEvent, EventDispatcher, EventSink, JsonlSink};
pub use machine::StateMachine;
