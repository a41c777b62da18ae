//! # fm-graph
//!
//! Task dependency graph for Foreman.
//!
//! Builds a directed graph from a project's task cards, refuses cyclic
//! dependency lists up front (reporting the full cycle path, not just
//! "a cycle exists"), computes the ready set, and resolves the
//! pending↔blocked gating that must be recomputed after every
//! task-state mutation.

pub mod error;
pub mod graph;

pub use error::GraphError;
pub use graph::{DependencyGraph, GatingChange};
