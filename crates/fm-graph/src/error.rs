// error.rs — Error types for dependency graph construction.

use thiserror::Error;

/// Errors found while building a dependency graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The dependency lists form a cycle. `cycle` holds every task on
    /// the cycle, in dependency order, so diagnostics can show the
    /// whole loop.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A card depends on itself.
    #[error("task {task} depends on itself")]
    SelfDependency { task: String },

    /// A card depends on an id that doesn't exist in this project.
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
}
