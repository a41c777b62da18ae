// machine.rs — StateMachine: the single validated write path.
//
// Every mutation follows the same shape: serialize on the project
// (pessimistic lock for multi-step transitions, optimistic CAS for
// simple field updates), validate against the fixed transition table
// and the per-pair guards, mutate in memory, recompute dependency
// gating and card counters, write with a version check, relocate the
// lifecycle bucket, then emit change events to subscribers.
//
// External file edits picked up by the change notifier come through
// `absorb_external`, which holds them to the same table and guards —
// there is deliberately no second write path.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use fm_graph::DependencyGraph;
use fm_lock::{atomic_update, LockCoordinator};
use fm_store::{Project, ProjectState, RecordStore, TaskState};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{ChangeCause, ChangeEvent, EventDispatcher, EventSink};

/// The workspace state engine.
///
/// Cheap to share: hold it in an `Arc` and call it from any number of
/// threads. Transitions on the same project serialize on its lock;
/// different projects proceed in parallel. The engine takes exactly one
/// lock per operation, so no lock ordering exists to get wrong.
pub struct StateMachine {
    config: EngineConfig,
    store: Arc<RecordStore>,
    locks: LockCoordinator,
    dispatcher: Arc<EventDispatcher>,
    /// Versions this engine wrote, keyed by project id. The change
    /// notifier uses this to tell its own echoes from external edits.
    written: Mutex<HashMap<String, u64>>,
}

impl StateMachine {
    /// Build an engine over the configured board, creating the bucket
    /// and lock directories if needed.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(RecordStore::open(&config.board_root)?);
        let locks = LockCoordinator::new(
            &config.lock_dir,
            format!("engine-{}", std::process::id()),
            config.lock_config(),
        )?;

        // The on-disk feed is always on; dashboards tail it.
        let dispatcher = Arc::new(EventDispatcher::new());
        dispatcher.subscribe(Box::new(crate::events::JsonlSink::new(&config.events_log)));

        Ok(Self {
            config,
            store,
            locks,
            dispatcher,
            written: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying record store (read-only collaborator access).
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Register an event sink for all future change events.
    pub fn subscribe(&self, sink: Box<dyn EventSink>) {
        self.dispatcher.subscribe(sink);
    }

    /// Persist a caller-built project in its inbox bucket.
    ///
    /// Creation is the caller's act, not a transition, so no change
    /// event is emitted; the record simply appears on the board.
    pub fn create_project(&self, project: &Project) -> Result<Project, EngineError> {
        let persisted = self.store.create(project)?;
        self.note_written(&persisted.project_id, persisted.version);
        tracing::info!(id = %persisted.project_id, "project filed on board");
        Ok(persisted)
    }

    /// Execute a validated project transition.
    ///
    /// The record's actual state must equal `from`, or the call fails
    /// with `StateMismatch` — a stale caller never overwrites a fresher
    /// transition. Unless `force` is set (privileged callers only),
    /// `to` must be in the allowed table and the per-pair guard must
    /// pass. Bucket relocation is coupled to the write.
    pub fn transition(
        &self,
        id: &str,
        from: ProjectState,
        to: ProjectState,
        reason: Option<&str>,
        force: bool,
    ) -> Result<Project, EngineError> {
        let (persisted, events) =
            self.locks
                .with_lock(id, self.config.lock_timeout(), || {
                    let (mut project, version) = self.store.read(id)?;
                    if project.state != from {
                        return Err(EngineError::StateMismatch {
                            id: id.to_string(),
                            expected: from,
                            actual: project.state,
                        });
                    }
                    if !force && !from.can_transition_to(&to) {
                        return Err(EngineError::InvalidTransition {
                            id: id.to_string(),
                            from,
                            to,
                            reason: "not in the allowed transition table".to_string(),
                        });
                    }
                    if !force {
                        self.check_guard(&project, from, to)?;
                    }

                    let mut events = Vec::new();
                    self.apply_effects(&mut project, from, to, reason, &mut events)?;
                    project.state = to;
                    project.updated_at = Utc::now();
                    project.refresh_card_counts();
                    debug_assert!(project.counters_consistent());

                    let persisted = self.store.write(id, &project, version)?;
                    self.relocate_if_strayed(id, to)?;
                    self.note_written(id, persisted.version);

                    events.insert(
                        0,
                        ChangeEvent::project(
                            id,
                            from,
                            to,
                            ChangeCause::Transition,
                            reason.map(String::from),
                        ),
                    );
                    Ok((persisted, events))
                })?;

        self.dispatch_all(&events);
        Ok(persisted)
    }

    /// Claim a card for a worker — the distinguished lock-free
    /// transition. Verifies the card is pending, unassigned, and has
    /// every dependency completed, then marks it in progress.
    ///
    /// Two workers racing on the same card are separated by the version
    /// counter: the loser re-reads, sees the assignee, and gets
    /// `AlreadyClaimed` instead of silently double-claiming.
    pub fn claim(
        &self,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> Result<Project, EngineError> {
        let persisted = atomic_update(
            &self.store,
            project_id,
            self.config.max_cas_retries,
            |mut project: Project| {
                if project.state != ProjectState::Active {
                    return Err(EngineError::StateMismatch {
                        id: project_id.to_string(),
                        expected: ProjectState::Active,
                        actual: project.state,
                    });
                }
                let graph = DependencyGraph::build(&project.tasks)?;
                let card = project.task(task_id).ok_or_else(|| EngineError::TaskNotFound {
                    project_id: project_id.to_string(),
                    task_id: task_id.to_string(),
                })?;

                match card.state {
                    TaskState::InProgress => Err(EngineError::AlreadyClaimed {
                        project_id: project_id.to_string(),
                        task_id: task_id.to_string(),
                        assignee: card
                            .assignee
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                    }),
                    TaskState::Blocked => Err(EngineError::DependencyUnmet {
                        project_id: project_id.to_string(),
                        task_id: task_id.to_string(),
                        reason: graph
                            .blocked_reason(task_id)
                            .unwrap_or_else(|| "blocked".to_string()),
                    }),
                    TaskState::Completed | TaskState::Failed => {
                        Err(EngineError::InvalidTaskTransition {
                            project_id: project_id.to_string(),
                            task_id: task_id.to_string(),
                            from: card.state,
                            to: TaskState::InProgress,
                        })
                    }
                    TaskState::Pending => {
                        if let Some(reason) = graph.blocked_reason(task_id) {
                            return Err(EngineError::DependencyUnmet {
                                project_id: project_id.to_string(),
                                task_id: task_id.to_string(),
                                reason,
                            });
                        }
                        let now = Utc::now();
                        if let Some(card) = project.task_mut(task_id) {
                            card.assignee = Some(worker_id.to_string());
                            card.started_at = Some(now);
                            card.state = TaskState::InProgress;
                        }
                        project.updated_at = now;
                        Ok(project)
                    }
                }
            },
        )
        .map_err(EngineError::from)?;

        self.note_written(project_id, persisted.version);
        self.dispatcher.dispatch(&ChangeEvent::task(
            project_id,
            task_id,
            TaskState::Pending,
            TaskState::InProgress,
            ChangeCause::Transition,
        ));
        Ok(persisted)
    }

    /// Mark a claimed card completed, refresh the rolled-up counters,
    /// and unblock any dependents in the same atomic write.
    pub fn complete_task(
        &self,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> Result<Project, EngineError> {
        let mut events = Vec::new();
        let persisted = atomic_update(
            &self.store,
            project_id,
            self.config.max_cas_retries,
            |mut project: Project| {
                events.clear();
                self.check_assignment(&project, project_id, task_id, worker_id)?;

                let now = Utc::now();
                if let Some(card) = project.task_mut(task_id) {
                    card.state = TaskState::Completed;
                    card.completed_at = Some(now);
                }
                events.push(ChangeEvent::task(
                    project_id,
                    task_id,
                    TaskState::InProgress,
                    TaskState::Completed,
                    ChangeCause::Transition,
                ));

                self.apply_gating(&mut project, &mut events, ChangeCause::Transition)?;
                project.refresh_card_counts();
                project.updated_at = now;
                debug_assert!(project.counters_consistent());
                Ok(project)
            },
        )
        .map_err(EngineError::from)?;

        self.note_written(project_id, persisted.version);
        self.dispatch_all(&events);
        Ok(persisted)
    }

    /// Record a card failure. While the retry ceiling allows, the card
    /// goes straight back to pending for another worker; past the
    /// ceiling it rests in failed state.
    pub fn fail_task(
        &self,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<Project, EngineError> {
        let mut events = Vec::new();
        let persisted = atomic_update(
            &self.store,
            project_id,
            self.config.max_cas_retries,
            |mut project: Project| {
                events.clear();
                self.check_assignment(&project, project_id, task_id, worker_id)?;

                let now = Utc::now();
                let mut requeued = false;
                if let Some(card) = project.task_mut(task_id) {
                    card.retry_count += 1;
                    card.failed_at = Some(now);
                    card.assignee = None;
                    requeued = card.retry_count <= card.max_retries;
                    card.state = if requeued {
                        TaskState::Pending
                    } else {
                        TaskState::Failed
                    };
                }

                events.push(ChangeEvent::task(
                    project_id,
                    task_id,
                    TaskState::InProgress,
                    TaskState::Failed,
                    ChangeCause::Transition,
                ));
                if requeued {
                    events.push(ChangeEvent::task(
                        project_id,
                        task_id,
                        TaskState::Failed,
                        TaskState::Pending,
                        ChangeCause::Transition,
                    ));
                }

                self.apply_gating(&mut project, &mut events, ChangeCause::Transition)?;
                project.refresh_card_counts();
                project.updated_at = now;
                debug_assert!(project.counters_consistent());
                Ok(project)
            },
        )
        .map_err(EngineError::from)?;

        tracing::info!(project_id, task_id, reason, "task failed");
        self.note_written(project_id, persisted.version);
        self.dispatch_all(&events);
        Ok(persisted)
    }

    /// Approve the project's human checkpoint.
    pub fn approve_checkpoint(
        &self,
        project_id: &str,
        approver: &str,
    ) -> Result<Project, EngineError> {
        let persisted = atomic_update(
            &self.store,
            project_id,
            self.config.max_cas_retries,
            |mut project: Project| {
                if !project.checkpoint_required {
                    return Err(EngineError::InvalidTransition {
                        id: project_id.to_string(),
                        from: project.state,
                        to: project.state,
                        reason: "project does not require a checkpoint".to_string(),
                    });
                }
                project.checkpoint_approved = true;
                project.updated_at = Utc::now();
                Ok(project)
            },
        )
        .map_err(EngineError::from)?;

        tracing::info!(project_id, approver, "checkpoint approved");
        self.note_written(project_id, persisted.version);
        Ok(persisted)
    }

    /// Ids of the cards currently eligible for claiming.
    pub fn ready_tasks(&self, project_id: &str) -> Result<BTreeSet<String>, EngineError> {
        let (project, _) = self.store.read(project_id)?;
        let graph = DependencyGraph::build(&project.tasks)?;
        Ok(graph.ready_set())
    }

    /// Whether (and why) a card is blocked.
    pub fn blocked_reason(
        &self,
        project_id: &str,
        task_id: &str,
    ) -> Result<Option<String>, EngineError> {
        let (project, _) = self.store.read(project_id)?;
        let graph = DependencyGraph::build(&project.tasks)?;
        Ok(graph.blocked_reason(task_id))
    }

    /// Absorb an externally-made edit observed by the change notifier.
    ///
    /// Reads the record fresh under the project lock, validates any
    /// top-level state change against the same transition table as
    /// internal callers, recomputes dependency gating and card counters
    /// (a card regressed from completed re-blocks its dependents here,
    /// immediately), heals a strayed bucket, and persists corrections —
    /// emitting events with cause `observed`.
    ///
    /// `last_known` is the notifier's cached state; `None` means the
    /// project is newly discovered.
    pub fn absorb_external(
        &self,
        id: &str,
        last_known: Option<ProjectState>,
    ) -> Result<Project, EngineError> {
        let (persisted, events) =
            self.locks
                .with_lock(id, self.config.lock_timeout(), || {
                    let (original, version) = self.store.read(id)?;
                    let mut project = original.clone();
                    let current = project.state;
                    let mut events = Vec::new();

                    match last_known {
                        Some(prior) if prior != current => {
                            if !prior.can_transition_to(&current) {
                                return Err(EngineError::InvalidTransition {
                                    id: id.to_string(),
                                    from: prior,
                                    to: current,
                                    reason: "externally edited state is not a valid transition"
                                        .to_string(),
                                });
                            }
                            self.validate_structure(id, &project, prior, current)?;
                            events.push(ChangeEvent::project(
                                id,
                                prior,
                                current,
                                ChangeCause::Observed,
                                None,
                            ));
                        }
                        // Newly discovered record: no transition to judge,
                        // but it must still be structurally sound.
                        None => self.validate_structure(id, &project, current, current)?,
                        Some(_) => {}
                    }

                    self.apply_gating(&mut project, &mut events, ChangeCause::Observed)?;
                    project.refresh_card_counts();
                    self.relocate_if_strayed(id, project.state)?;

                    let persisted = if project != original {
                        project.updated_at = Utc::now();
                        self.store.write(id, &project, version)?
                    } else {
                        original
                    };
                    self.note_written(id, persisted.version);
                    Ok((persisted, events))
                })?;

        self.dispatch_all(&events);
        Ok(persisted)
    }

    /// The last version this engine itself wrote for `id`, if any.
    pub fn last_written_version(&self, id: &str) -> Option<u64> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    // ---- internals ----------------------------------------------------

    /// Per-(from, to) transition guards. The table is data: adding a
    /// policy is a new match arm, not a new type.
    fn check_guard(
        &self,
        project: &Project,
        from: ProjectState,
        to: ProjectState,
    ) -> Result<(), EngineError> {
        let refuse = |reason: String| {
            Err(EngineError::InvalidTransition {
                id: project.project_id.clone(),
                from,
                to,
                reason,
            })
        };

        match (from, to) {
            (ProjectState::Inbox, ProjectState::Backlog) => match project.validate() {
                Ok(()) => Ok(()),
                Err(problem) => refuse(format!("structural validation failed: {}", problem)),
            },
            (ProjectState::Backlog, ProjectState::Active) => {
                let graph = DependencyGraph::build(&project.tasks)?;
                if graph.ready_set().is_empty() {
                    refuse("no ready task: every card is blocked, claimed, or finished".to_string())
                } else {
                    Ok(())
                }
            }
            (ProjectState::Active, ProjectState::Review) => {
                if !project.all_tasks_completed() {
                    refuse(format!(
                        "{} of {} cards completed",
                        project.cards_completed, project.cards_total
                    ))
                } else if !project.checkpoint_required {
                    refuse("no checkpoint required: complete the project directly".to_string())
                } else {
                    Ok(())
                }
            }
            (ProjectState::Active, ProjectState::Completed) => {
                if !project.all_tasks_completed() {
                    refuse(format!(
                        "{} of {} cards completed",
                        project.cards_completed, project.cards_total
                    ))
                } else if project.checkpoint_required && !project.checkpoint_approved {
                    refuse("checkpoint required but not approved".to_string())
                } else {
                    Ok(())
                }
            }
            (ProjectState::Review, ProjectState::Completed) => {
                if project.checkpoint_approved {
                    Ok(())
                } else {
                    refuse("checkpoint not approved".to_string())
                }
            }
            // Failure and retry carry no preconditions; the rest of the
            // table has no guard beyond membership.
            _ => Ok(()),
        }
    }

    /// Per-(from, to) side effects, applied before the state flips.
    fn apply_effects(
        &self,
        project: &mut Project,
        from: ProjectState,
        to: ProjectState,
        reason: Option<&str>,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<(), EngineError> {
        match (from, to) {
            (_, ProjectState::Failed) => {
                project.failure_reason =
                    Some(reason.unwrap_or("unspecified failure").to_string());
            }
            (ProjectState::Failed, ProjectState::Backlog) => {
                project.retry_count += 1;
                project.failure_reason = None;
                for card in project.tasks.iter_mut() {
                    card.retry_count = 0;
                    if card.state == TaskState::Failed {
                        card.state = TaskState::Pending;
                        card.assignee = None;
                        card.failed_at = None;
                        events.push(ChangeEvent::task(
                            &project.project_id,
                            &card.task_id,
                            TaskState::Failed,
                            TaskState::Pending,
                            ChangeCause::Transition,
                        ));
                    }
                }
                self.apply_gating(project, events, ChangeCause::Transition)?;
            }
            (ProjectState::Backlog, ProjectState::Active) => {
                self.apply_gating(project, events, ChangeCause::Transition)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Recompute pending↔blocked gating and apply the changes, pushing
    /// one event per regated card.
    fn apply_gating(
        &self,
        project: &mut Project,
        events: &mut Vec<ChangeEvent>,
        cause: ChangeCause,
    ) -> Result<(), EngineError> {
        let graph = DependencyGraph::build(&project.tasks)?;
        for change in graph.resolve_gating() {
            if let Some(card) = project.task_mut(&change.task_id) {
                card.state = change.to;
            }
            events.push(ChangeEvent::task(
                &project.project_id,
                &change.task_id,
                change.from,
                change.to,
                cause,
            ));
        }
        Ok(())
    }

    /// Shared precondition for completing/failing a card: it must be in
    /// progress and held by this worker.
    fn check_assignment(
        &self,
        project: &Project,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> Result<(), EngineError> {
        let card = project.task(task_id).ok_or_else(|| EngineError::TaskNotFound {
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
        })?;
        if card.state != TaskState::InProgress {
            return Err(EngineError::InvalidTaskTransition {
                project_id: project_id.to_string(),
                task_id: task_id.to_string(),
                from: card.state,
                to: TaskState::Completed,
            });
        }
        if card.assignee.as_deref() != Some(worker_id) {
            return Err(EngineError::AlreadyClaimed {
                project_id: project_id.to_string(),
                task_id: task_id.to_string(),
                assignee: card
                    .assignee
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(())
    }

    fn validate_structure(
        &self,
        id: &str,
        project: &Project,
        from: ProjectState,
        to: ProjectState,
    ) -> Result<(), EngineError> {
        project
            .validate()
            .map_err(|problem| EngineError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
                reason: format!("structural validation failed: {}", problem),
            })
    }

    /// Move the project directory to the bucket matching `state` if a
    /// crash or external mv left it somewhere else.
    fn relocate_if_strayed(&self, id: &str, state: ProjectState) -> Result<(), EngineError> {
        if let Some(at) = self.store.locate(id) {
            if at != state {
                self.store.relocate(id, at, state)?;
            }
        }
        Ok(())
    }

    fn dispatch_all(&self, events: &[ChangeEvent]) {
        for event in events {
            self.dispatcher.dispatch(event);
        }
    }

    fn note_written(&self, id: &str, version: u64) {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_store::{StoreError, TaskCard};
    use tempfile::tempdir;

    fn engine(root: &std::path::Path) -> StateMachine {
        StateMachine::new(EngineConfig::for_root(root)).unwrap()
    }

    fn chained_project(id: &str) -> Project {
        let mut p = Project::new(id, "Chained work");
        p.push_task(TaskCard::new("t1", 0));
        p.push_task(TaskCard::new("t2", 1).with_dependencies(vec!["t1".to_string()]));
        p
    }

    /// Walk a freshly-created project into the active state.
    fn activate(machine: &StateMachine, id: &str) {
        machine
            .transition(id, ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap();
        machine
            .transition(id, ProjectState::Backlog, ProjectState::Active, None, false)
            .unwrap();
    }

    #[test]
    fn transition_moves_record_and_bucket() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let project = machine
            .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap();

        assert_eq!(project.state, ProjectState::Backlog);
        assert_eq!(machine.store().locate("p1"), Some(ProjectState::Backlog));
    }

    #[test]
    fn transition_with_stale_from_state_is_a_mismatch() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        machine
            .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap();

        // A second caller still believes the project is in the inbox.
        let err = machine
            .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::StateMismatch { .. }));
    }

    #[test]
    fn off_table_transition_fails_unless_forced() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let err = machine
            .transition("p1", ProjectState::Inbox, ProjectState::Completed, None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        // A privileged caller can force it; the bucket follows.
        let project = machine
            .transition("p1", ProjectState::Inbox, ProjectState::Completed, None, true)
            .unwrap();
        assert_eq!(project.state, ProjectState::Completed);
        assert_eq!(machine.store().locate("p1"), Some(ProjectState::Completed));
    }

    #[test]
    fn inbox_to_backlog_requires_structural_validity() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        let mut malformed = chained_project("p1");
        malformed.name = String::new();
        machine.create_project(&malformed).unwrap();

        let err = machine
            .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn backlog_to_active_requires_a_ready_task() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        // No cards at all — nothing is ready.
        machine
            .create_project(&Project::new("empty", "No cards"))
            .unwrap();
        machine
            .transition("empty", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap();
        let err = machine
            .transition("empty", ProjectState::Backlog, ProjectState::Active, None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn activation_blocks_cards_with_unmet_dependencies() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");

        let (project, _) = machine.store().read("p1").unwrap();
        assert_eq!(project.task("t1").unwrap().state, TaskState::Pending);
        assert_eq!(project.task("t2").unwrap().state, TaskState::Blocked);
    }

    #[test]
    fn cyclic_dependencies_block_activation() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        let mut p = Project::new("p1", "Cyclic");
        p.push_task(TaskCard::new("t1", 0).with_dependencies(vec!["t2".to_string()]));
        p.push_task(TaskCard::new("t2", 1).with_dependencies(vec!["t1".to_string()]));
        machine.create_project(&p).unwrap();

        // Structural validation passes (ids all exist), but the graph
        // build inside the activation guard reports the cycle.
        machine
            .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap();
        let err = machine
            .transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(fm_graph::GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn claim_and_double_claim() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");

        let project = machine.claim("p1", "t1", "worker-a").unwrap();
        let card = project.task("t1").unwrap();
        assert_eq!(card.state, TaskState::InProgress);
        assert_eq!(card.assignee.as_deref(), Some("worker-a"));
        assert!(card.started_at.is_some());

        let err = machine.claim("p1", "t1", "worker-b").unwrap_err();
        assert!(matches!(
            err,
            EngineError::AlreadyClaimed { assignee, .. } if assignee == "worker-a"
        ));
    }

    #[test]
    fn claim_of_blocked_card_reports_unmet_dependencies() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");

        let err = machine.claim("p1", "t2", "worker-a").unwrap_err();
        assert!(matches!(
            err,
            EngineError::DependencyUnmet { reason, .. } if reason.contains("t1")
        ));
    }

    #[test]
    fn claim_outside_active_project_is_refused() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let err = machine.claim("p1", "t1", "worker-a").unwrap_err();
        assert!(matches!(err, EngineError::StateMismatch { .. }));
    }

    #[test]
    fn completing_a_card_unblocks_its_dependents() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");

        machine.claim("p1", "t1", "worker-a").unwrap();
        let project = machine.complete_task("p1", "t1", "worker-a").unwrap();

        assert_eq!(project.task("t1").unwrap().state, TaskState::Completed);
        assert_eq!(project.task("t2").unwrap().state, TaskState::Pending);
        assert_eq!(project.cards_completed, 1);
    }

    #[test]
    fn only_the_assignee_can_complete_a_card() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");
        machine.claim("p1", "t1", "worker-a").unwrap();

        let err = machine.complete_task("p1", "t1", "worker-b").unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClaimed { .. }));
    }

    #[test]
    fn failed_card_requeues_until_the_retry_ceiling() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        let mut p = Project::new("p1", "Flaky work");
        let mut card = TaskCard::new("t1", 0);
        card.max_retries = 1;
        p.push_task(card);
        machine.create_project(&p).unwrap();
        activate(&machine, "p1");

        // First failure: requeued.
        machine.claim("p1", "t1", "worker-a").unwrap();
        let project = machine.fail_task("p1", "t1", "worker-a", "flaked").unwrap();
        assert_eq!(project.task("t1").unwrap().state, TaskState::Pending);
        assert_eq!(project.task("t1").unwrap().retry_count, 1);

        // Second failure: ceiling hit, the card rests in failed.
        machine.claim("p1", "t1", "worker-a").unwrap();
        let project = machine.fail_task("p1", "t1", "worker-a", "flaked again").unwrap();
        assert_eq!(project.task("t1").unwrap().state, TaskState::Failed);
        assert_eq!(project.cards_failed, 1);
    }

    #[test]
    fn project_failure_records_reason_and_bucket() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");

        let project = machine
            .transition(
                "p1",
                ProjectState::Active,
                ProjectState::Failed,
                Some("worker pool drained"),
                false,
            )
            .unwrap();
        assert_eq!(project.failure_reason.as_deref(), Some("worker pool drained"));
        assert_eq!(machine.store().locate("p1"), Some(ProjectState::Failed));
    }

    #[test]
    fn retry_resets_cards_and_counters() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        let mut p = Project::new("p1", "Retryable");
        let mut card = TaskCard::new("t1", 0);
        card.max_retries = 0;
        p.push_task(card);
        machine.create_project(&p).unwrap();
        activate(&machine, "p1");

        machine.claim("p1", "t1", "worker-a").unwrap();
        machine.fail_task("p1", "t1", "worker-a", "broken").unwrap();
        machine
            .transition("p1", ProjectState::Active, ProjectState::Failed, Some("dead"), false)
            .unwrap();

        let project = machine
            .transition("p1", ProjectState::Failed, ProjectState::Backlog, None, false)
            .unwrap();
        assert_eq!(project.retry_count, 1);
        assert!(project.failure_reason.is_none());
        let card = project.task("t1").unwrap();
        assert_eq!(card.state, TaskState::Pending);
        assert_eq!(card.retry_count, 0);
        assert_eq!(project.cards_failed, 0);
    }

    #[test]
    fn completion_gated_on_checkpoint_approval() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        let mut p = Project::new("p1", "Gated");
        p.checkpoint_required = true;
        p.push_task(TaskCard::new("t1", 0));
        machine.create_project(&p).unwrap();
        activate(&machine, "p1");
        machine.claim("p1", "t1", "worker-a").unwrap();
        machine.complete_task("p1", "t1", "worker-a").unwrap();

        // Direct completion is refused while unapproved.
        let err = machine
            .transition("p1", ProjectState::Active, ProjectState::Completed, None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        // Review path: move to review, approve, then complete.
        machine
            .transition("p1", ProjectState::Active, ProjectState::Review, None, false)
            .unwrap();
        machine.approve_checkpoint("p1", "reviewer").unwrap();
        let project = machine
            .transition("p1", ProjectState::Review, ProjectState::Completed, None, false)
            .unwrap();
        assert_eq!(project.state, ProjectState::Completed);
    }

    #[test]
    fn review_requires_a_checkpoint() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());

        let mut p = Project::new("p1", "Plain");
        p.push_task(TaskCard::new("t1", 0));
        machine.create_project(&p).unwrap();
        activate(&machine, "p1");
        machine.claim("p1", "t1", "worker-a").unwrap();
        machine.complete_task("p1", "t1", "worker-a").unwrap();

        let err = machine
            .transition("p1", ProjectState::Active, ProjectState::Review, None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn every_successful_write_bumps_the_version_once() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let v1 = machine.store().read("p1").unwrap().1;
        machine
            .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
            .unwrap();
        let v2 = machine.store().read("p1").unwrap().1;
        machine
            .transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
            .unwrap();
        let v3 = machine.store().read("p1").unwrap().1;

        assert_eq!((v1, v2, v3), (1, 2, 3));
        assert_eq!(machine.last_written_version("p1"), Some(3));
    }

    #[test]
    fn transitions_emit_events_to_subscribers() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        machine.subscribe(Box::new(crate::events::CallbackSink(
            move |event: &ChangeEvent| {
                tx.send(event.clone()).ok();
            },
        )));

        activate(&machine, "p1");

        let first = rx.recv().unwrap();
        assert!(matches!(
            first,
            ChangeEvent::ProjectStateChanged {
                from_state: ProjectState::Inbox,
                to_state: ProjectState::Backlog,
                cause: ChangeCause::Transition,
                ..
            }
        ));

        // Activation emits the project event plus the t2 blocking event.
        let rest: Vec<ChangeEvent> = rx.try_iter().collect();
        assert!(rest.iter().any(|e| matches!(
            e,
            ChangeEvent::TaskStateChanged { task_id, to_state: TaskState::Blocked, .. } if task_id == "t2"
        )));
    }

    #[test]
    fn absorb_external_validates_and_republishes() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        // An external writer moves the project to backlog by hand.
        let store = machine.store();
        let (mut project, version) = store.read("p1").unwrap();
        project.state = ProjectState::Backlog;
        store.write("p1", &project, version).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        machine.subscribe(Box::new(crate::events::CallbackSink(
            move |event: &ChangeEvent| {
                tx.send(event.clone()).ok();
            },
        )));

        let absorbed = machine
            .absorb_external("p1", Some(ProjectState::Inbox))
            .unwrap();
        assert_eq!(absorbed.state, ProjectState::Backlog);
        // The strayed bucket was healed to match the edited state.
        assert_eq!(store.locate("p1"), Some(ProjectState::Backlog));

        let event = rx.recv().unwrap();
        assert_eq!(event.cause(), ChangeCause::Observed);
    }

    #[test]
    fn absorb_external_refuses_invalid_jumps() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let store = machine.store();
        let (mut project, version) = store.read("p1").unwrap();
        project.state = ProjectState::Completed;
        store.write("p1", &project, version).unwrap();

        let err = machine
            .absorb_external("p1", Some(ProjectState::Inbox))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn absorb_external_reblocks_dependents_of_a_regressed_card() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();
        activate(&machine, "p1");
        machine.claim("p1", "t1", "worker-a").unwrap();
        machine.complete_task("p1", "t1", "worker-a").unwrap();

        // An external edit regresses t1 from completed to pending.
        let store = machine.store();
        let (mut project, version) = store.read("p1").unwrap();
        if let Some(card) = project.task_mut("t1") {
            card.state = TaskState::Pending;
            card.assignee = None;
            card.completed_at = None;
        }
        store.write("p1", &project, version).unwrap();

        let absorbed = machine
            .absorb_external("p1", Some(ProjectState::Active))
            .unwrap();
        // t2 had been unblocked by t1's completion; the regression
        // re-blocks it immediately, in the same absorbed write.
        assert_eq!(absorbed.task("t2").unwrap().state, TaskState::Blocked);
        assert_eq!(absorbed.cards_completed, 0);
    }

    #[test]
    fn absorbing_a_corrupt_record_surfaces_corrupt() {
        let dir = tempdir().unwrap();
        let machine = engine(dir.path());
        machine.create_project(&chained_project("p1")).unwrap();

        let path = machine
            .store()
            .project_dir(ProjectState::Inbox, "p1")
            .join("project.json");
        std::fs::write(&path, "{ torn write").unwrap();

        let err = machine.absorb_external("p1", None).unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Corrupt { .. })));
    }
}
