// project.rs — Project and TaskCard: the persisted board records.
//
// A Project is one unit of orchestrated work. It embeds an ordered list
// of TaskCards — the atomic units workers claim and execute. Both carry
// their own lifecycle state enum; the valid transitions form a fixed
// table that the engine enforces on every mutation, internal or
// externally observed.
//
// The bucket directory a project lives in always mirrors its state, so
// the board can be browsed (and watched) by lifecycle stage.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The lifecycle state of a project. Doubles as the name of the bucket
/// directory the project record lives in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    /// Newly filed, not yet validated or prioritized.
    Inbox,

    /// Validated and queued — waiting for a worker pool to pick it up.
    Backlog,

    /// Workers are actively claiming and executing its cards.
    Active,

    /// All cards done, waiting on a human checkpoint.
    Review,

    /// Finished successfully. Terminal.
    Completed,

    /// Failed somewhere along the way; retryable back to backlog.
    Failed,
}

impl ProjectState {
    /// All states, in lifecycle order. Also the set of bucket directories.
    pub const ALL: [ProjectState; 6] = [
        ProjectState::Inbox,
        ProjectState::Backlog,
        ProjectState::Active,
        ProjectState::Review,
        ProjectState::Completed,
        ProjectState::Failed,
    ];

    /// The bucket directory name for this state.
    pub fn bucket(&self) -> &'static str {
        match self {
            ProjectState::Inbox => "inbox",
            ProjectState::Backlog => "backlog",
            ProjectState::Active => "active",
            ProjectState::Review => "review",
            ProjectState::Completed => "completed",
            ProjectState::Failed => "failed",
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectState::Completed)
    }

    /// Check whether transitioning from this state to `next` is valid.
    ///
    /// The valid transitions form a directed graph:
    ///   Inbox → Backlog → Active → Review → Completed
    ///   Active → Completed (no checkpoint required)
    ///   Any non-terminal state → Failed
    ///   Failed → Backlog (retry)
    pub fn can_transition_to(&self, next: &ProjectState) -> bool {
        // Failure is reachable from every non-terminal state.
        if matches!(next, ProjectState::Failed) {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (ProjectState::Inbox, ProjectState::Backlog)
                | (ProjectState::Backlog, ProjectState::Active)
                | (ProjectState::Active, ProjectState::Review)
                | (ProjectState::Active, ProjectState::Completed)
                | (ProjectState::Review, ProjectState::Completed)
                | (ProjectState::Failed, ProjectState::Backlog)
        )
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bucket())
    }
}

impl std::str::FromStr for ProjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectState::ALL
            .iter()
            .find(|state| state.bucket() == s)
            .copied()
            .ok_or_else(|| format!("unknown project state '{}'", s))
    }
}

/// The lifecycle state of a task card.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Eligible for claiming once every dependency is completed.
    Pending,

    /// Held back by an unmet dependency. Returns to pending when all
    /// dependencies are completed again.
    Blocked,

    /// Claimed by a worker and being executed.
    InProgress,

    /// Done. Terminal.
    Completed,

    /// The worker gave up; retryable back to pending.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed)
    }

    /// Check whether transitioning from this state to `next` is valid.
    ///
    ///   Pending → InProgress → Completed
    ///   Pending ↔ Blocked (dependency gating)
    ///   InProgress → Failed, Failed → Pending (retry)
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::InProgress)
                | (TaskState::Pending, TaskState::Blocked)
                | (TaskState::Blocked, TaskState::Pending)
                | (TaskState::InProgress, TaskState::Completed)
                | (TaskState::InProgress, TaskState::Failed)
                | (TaskState::Failed, TaskState::Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Blocked => write!(f, "blocked"),
            TaskState::InProgress => write!(f, "in_progress"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// One atomic unit of work within a project.
///
/// Cards are embedded in their parent project record and never persisted
/// on their own. A card lists the ids of the cards it depends on; all
/// dependencies must be within the same project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCard {
    /// Identifier, unique within the parent project.
    pub task_id: String,

    /// Position in the project's ordered card list.
    pub sequence: u32,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Worker currently holding the card, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// When a worker claimed the card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the card was completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the card last failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// How many times this card has failed so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Failure ceiling — past this, a failed card stays failed.
    #[serde(default = "TaskCard::default_max_retries")]
    pub max_retries: u32,

    /// Ids of cards in the same project that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Whether completing this card needs a human checkpoint.
    #[serde(default)]
    pub checkpoint_required: bool,
}

impl TaskCard {
    fn default_max_retries() -> u32 {
        3
    }

    /// Create a pending card with no dependencies.
    pub fn new(task_id: impl Into<String>, sequence: u32) -> Self {
        Self {
            task_id: task_id.into(),
            sequence,
            state: TaskState::Pending,
            assignee: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: Self::default_max_retries(),
            depends_on: Vec::new(),
            checkpoint_required: false,
        }
    }

    /// Builder-style dependency declaration.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// One unit of orchestrated work, embedding its task cards.
///
/// The record is the authoritative state shared between workers and the
/// dashboard. `version` increments on every successful write and backs
/// the optimistic-concurrency path; the state machine keeps the bucket
/// directory in lockstep with `state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    /// Unique identifier; also the project's directory name.
    pub project_id: String,

    /// Human-readable display name.
    pub name: String,

    /// Current lifecycle state.
    pub state: ProjectState,

    /// Scheduling priority, 0–100.
    pub priority: u8,

    /// Worker currently assigned to the project, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Whether completion requires a human checkpoint.
    #[serde(default)]
    pub checkpoint_required: bool,

    /// Whether the checkpoint has been approved.
    #[serde(default)]
    pub checkpoint_approved: bool,

    /// How many times the project has been retried out of `failed`.
    #[serde(default)]
    pub retry_count: u32,

    /// Why the project last failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Rolled-up card counters. Invariant: completed + failed ≤ total.
    pub cards_total: u32,
    pub cards_completed: u32,
    pub cards_failed: u32,

    /// Monotonic write counter for optimistic concurrency. Zero until
    /// the record is first persisted.
    #[serde(default)]
    pub version: u64,

    /// When the project was filed.
    pub created_at: DateTime<Utc>,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,

    /// The ordered task cards.
    #[serde(default)]
    pub tasks: Vec<TaskCard>,
}

impl Project {
    /// Create a new project in the inbox with no cards.
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            name: name.into(),
            state: ProjectState::Inbox,
            priority: 50,
            worker: None,
            checkpoint_required: false,
            checkpoint_approved: false,
            retry_count: 0,
            failure_reason: None,
            cards_total: 0,
            cards_completed: 0,
            cards_failed: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            tasks: Vec::new(),
        }
    }

    /// Append a card and bump the total counter.
    pub fn push_task(&mut self, card: TaskCard) {
        self.tasks.push(card);
        self.cards_total = self.tasks.len() as u32;
    }

    /// Look up a card by id.
    pub fn task(&self, task_id: &str) -> Option<&TaskCard> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Look up a card mutably by id.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskCard> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    /// Recompute the rolled-up card counters from the card list.
    pub fn refresh_card_counts(&mut self) {
        self.cards_total = self.tasks.len() as u32;
        self.cards_completed = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .count() as u32;
        self.cards_failed = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed)
            .count() as u32;
    }

    /// Whether the card counters satisfy `completed + failed ≤ total`.
    pub fn counters_consistent(&self) -> bool {
        self.cards_completed + self.cards_failed <= self.cards_total
    }

    /// Whether every card has completed.
    pub fn all_tasks_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Completed)
    }

    /// Structural validation shared by the inbox→backlog guard and the
    /// external-edit absorption path. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.project_id.trim().is_empty() {
            return Err("project id is empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("project name is empty".to_string());
        }
        if self.priority > 100 {
            return Err(format!("priority {} out of range 0–100", self.priority));
        }
        if !self.counters_consistent() {
            return Err(format!(
                "card counters inconsistent: {} completed + {} failed > {} total",
                self.cards_completed, self.cards_failed, self.cards_total
            ));
        }
        for card in &self.tasks {
            if card.task_id.trim().is_empty() {
                return Err("task card with empty id".to_string());
            }
            for dep in &card.depends_on {
                if dep == &card.task_id {
                    return Err(format!("task {} depends on itself", card.task_id));
                }
                if self.task(dep).is_none() {
                    return Err(format!(
                        "task {} depends on unknown task {}",
                        card.task_id, dep
                    ));
                }
            }
        }
        Ok(())
    }
}
