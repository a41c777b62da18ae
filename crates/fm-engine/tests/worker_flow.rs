// worker_flow.rs — End-to-end integration test for the state engine.
//
// This single test exercises the complete Foreman flow:
//
//   1. A project with two cards (t2 depends on t1) is filed in the inbox
//   2. inbox → backlog (structural validation) → active (readiness)
//   3. Activation blocks t2 behind t1
//   4. worker-a claims t1; worker-b's claim of the same card fails
//   5. Completing t1 unblocks t2 in the same write
//   6. t2 is claimed and completed; the project completes
//   7. Counters and the version counter stay consistent throughout
//
// Alongside it: the concurrency races (simultaneous transition, claim
// race, lost-update counting) and the forced-transition escape hatch.

use std::sync::mpsc;
use std::sync::Arc;

use tempfile::tempdir;

use fm_engine::{
    CallbackSink, ChangeCause, ChangeEvent, EngineConfig, EngineError, StateMachine,
};
use fm_store::{Project, ProjectState, TaskCard, TaskState};

fn engine(root: &std::path::Path) -> Arc<StateMachine> {
    Arc::new(StateMachine::new(EngineConfig::for_root(root)).unwrap())
}

fn chained_project(id: &str) -> Project {
    let mut p = Project::new(id, "Two-card chain");
    p.push_task(TaskCard::new("t1", 0));
    p.push_task(TaskCard::new("t2", 1).with_dependencies(vec!["t1".to_string()]));
    p
}

/// The full worker walkthrough on one project.
#[test]
fn two_workers_drive_a_project_to_completion() {
    let dir = tempdir().unwrap();
    let machine = engine(dir.path());

    // Subscribe before anything moves so every event is captured.
    let (tx, rx) = mpsc::channel();
    machine.subscribe(Box::new(CallbackSink(move |event: &ChangeEvent| {
        tx.send(event.clone()).ok();
    })));

    // =========================================================
    // STEP 1: File the project and walk it to active
    // =========================================================
    machine.create_project(&chained_project("p1")).unwrap();
    machine
        .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
        .unwrap();
    machine
        .transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
        .unwrap();

    // Activation gates t2 behind t1.
    let (project, _) = machine.store().read("p1").unwrap();
    assert_eq!(project.task("t1").unwrap().state, TaskState::Pending);
    assert_eq!(project.task("t2").unwrap().state, TaskState::Blocked);
    assert_eq!(machine.store().locate("p1"), Some(ProjectState::Active));

    // =========================================================
    // STEP 2: worker-a claims t1; worker-b is turned away
    // =========================================================
    machine.claim("p1", "t1", "worker-a").unwrap();
    let err = machine.claim("p1", "t1", "worker-b").unwrap_err();
    assert!(matches!(
        err,
        EngineError::AlreadyClaimed { assignee, .. } if assignee == "worker-a"
    ));

    // t2 is still gated — nobody can jump the queue.
    assert!(matches!(
        machine.claim("p1", "t2", "worker-b").unwrap_err(),
        EngineError::DependencyUnmet { .. }
    ));

    // =========================================================
    // STEP 3: Completing t1 unblocks t2 atomically
    // =========================================================
    let project = machine.complete_task("p1", "t1", "worker-a").unwrap();
    assert_eq!(project.task("t2").unwrap().state, TaskState::Pending);
    assert_eq!(project.cards_completed, 1);
    assert!(machine.ready_tasks("p1").unwrap().contains("t2"));

    // Completion is refused while work remains.
    assert!(matches!(
        machine
            .transition("p1", ProjectState::Active, ProjectState::Completed, None, false)
            .unwrap_err(),
        EngineError::InvalidTransition { .. }
    ));

    // =========================================================
    // STEP 4: worker-b finishes t2 and the project completes
    // =========================================================
    machine.claim("p1", "t2", "worker-b").unwrap();
    machine.complete_task("p1", "t2", "worker-b").unwrap();
    let project = machine
        .transition("p1", ProjectState::Active, ProjectState::Completed, None, false)
        .unwrap();

    assert_eq!(project.state, ProjectState::Completed);
    assert_eq!(project.cards_completed, 2);
    assert_eq!(machine.store().locate("p1"), Some(ProjectState::Completed));

    // =========================================================
    // VERIFY: events, counters, and the version counter
    // =========================================================
    let events: Vec<ChangeEvent> = rx.try_iter().collect();

    // Every emitted event is an internal transition here.
    assert!(events.iter().all(|e| e.cause() == ChangeCause::Transition));

    // The project-level trail reads inbox → backlog → active → completed.
    let trail: Vec<(ProjectState, ProjectState)> = events
        .iter()
        .filter_map(|e| match e {
            ChangeEvent::ProjectStateChanged {
                from_state,
                to_state,
                ..
            } => Some((*from_state, *to_state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        trail,
        vec![
            (ProjectState::Inbox, ProjectState::Backlog),
            (ProjectState::Backlog, ProjectState::Active),
            (ProjectState::Active, ProjectState::Completed),
        ]
    );

    // t2's gating shows up as blocked-then-unblocked task events.
    assert!(events.iter().any(|e| matches!(
        e,
        ChangeEvent::TaskStateChanged { task_id, to_state: TaskState::Blocked, .. } if task_id == "t2"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ChangeEvent::TaskStateChanged {
            task_id,
            from_state: TaskState::Blocked,
            to_state: TaskState::Pending,
            ..
        } if task_id == "t2"
    )));

    // Counters never over-count, and the version counted every write:
    // create, 2 walk-in transitions, 2 claims, 2 completions, 1 final.
    let (project, version) = machine.store().read("p1").unwrap();
    assert!(project.counters_consistent());
    assert_eq!(version, 8);
}

/// Two callers race the same transition; the lock serializes them and
/// the loser learns its read was stale.
#[test]
fn simultaneous_transitions_resolve_to_one_winner() {
    let dir = tempdir().unwrap();
    let machine = engine(dir.path());
    machine.create_project(&chained_project("p1")).unwrap();
    machine
        .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let machine = Arc::clone(&machine);
        handles.push(std::thread::spawn(move || {
            machine.transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
        }));
    }
    let outcomes: Vec<Result<Project, EngineError>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(EngineError::StateMismatch { actual, .. })
            if *actual == ProjectState::Active)));
}

/// Two workers race one card; the version counter separates them.
#[test]
fn claim_race_admits_exactly_one_worker() {
    let dir = tempdir().unwrap();
    let machine = engine(dir.path());
    machine.create_project(&chained_project("p1")).unwrap();
    machine
        .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
        .unwrap();
    machine
        .transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
        .unwrap();

    let mut handles = Vec::new();
    for worker in ["worker-a", "worker-b"] {
        let machine = Arc::clone(&machine);
        handles.push(std::thread::spawn(move || {
            machine.claim("p1", "t1", worker)
        }));
    }
    let outcomes: Vec<Result<Project, EngineError>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(EngineError::AlreadyClaimed { .. }))));

    let (project, _) = machine.store().read("p1").unwrap();
    let card = project.task("t1").unwrap();
    assert_eq!(card.state, TaskState::InProgress);
    assert!(card.assignee.is_some());
}

/// Concurrent workers claiming different cards all succeed, and the
/// version counter equals the number of successful writes.
#[test]
fn parallel_claims_on_disjoint_cards_lose_nothing() {
    let dir = tempdir().unwrap();
    let machine = engine(dir.path());

    let mut p = Project::new("p1", "Fan-out");
    for i in 0..6 {
        p.push_task(TaskCard::new(format!("t{}", i), i));
    }
    machine.create_project(&p).unwrap();
    machine
        .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
        .unwrap();
    machine
        .transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let machine = Arc::clone(&machine);
        handles.push(std::thread::spawn(move || {
            machine.claim("p1", &format!("t{}", i), &format!("worker-{}", i))
        }));
    }
    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }

    let (project, version) = machine.store().read("p1").unwrap();
    assert!(project
        .tasks
        .iter()
        .all(|card| card.state == TaskState::InProgress));
    // create + 2 transitions + 6 claims.
    assert_eq!(version, 9);
}

/// The escape hatch: off-table jumps need force, and force works.
#[test]
fn forced_transition_overrides_the_table() {
    let dir = tempdir().unwrap();
    let machine = engine(dir.path());
    machine.create_project(&chained_project("p1")).unwrap();

    assert!(matches!(
        machine
            .transition("p1", ProjectState::Inbox, ProjectState::Completed, None, false)
            .unwrap_err(),
        EngineError::InvalidTransition { .. }
    ));

    let project = machine
        .transition(
            "p1",
            ProjectState::Inbox,
            ProjectState::Completed,
            Some("operator override"),
            true,
        )
        .unwrap();
    assert_eq!(project.state, ProjectState::Completed);
    assert_eq!(machine.store().locate("p1"), Some(ProjectState::Completed));
}

/// Failure and retry round trip: the project fails out of active, then
/// retries into backlog with its cards reset.
#[test]
fn failure_and_retry_reset_the_board_state() {
    let dir = tempdir().unwrap();
    let machine = engine(dir.path());
    machine.create_project(&chained_project("p1")).unwrap();
    machine
        .transition("p1", ProjectState::Inbox, ProjectState::Backlog, None, false)
        .unwrap();
    machine
        .transition("p1", ProjectState::Backlog, ProjectState::Active, None, false)
        .unwrap();
    machine.claim("p1", "t1", "worker-a").unwrap();

    machine
        .transition(
            "p1",
            ProjectState::Active,
            ProjectState::Failed,
            Some("worker heartbeats lost"),
            false,
        )
        .unwrap();
    assert_eq!(machine.store().locate("p1"), Some(ProjectState::Failed));

    let project = machine
        .transition("p1", ProjectState::Failed, ProjectState::Backlog, None, false)
        .unwrap();
    assert_eq!(project.retry_count, 1);
    assert!(project.failure_reason.is_none());
    assert!(project.tasks.iter().all(|card| card.retry_count == 0));
    assert_eq!(machine.store().locate("p1"), Some(ProjectState::Backlog));
}
