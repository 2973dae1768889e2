//! Coordination store integration tests.
//!
//! These tests verify that the event log stays the single source of truth
//! under concurrent callers, and that projections can always be rebuilt
//! from it.

use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::thread;

use tokio_test::assert_ok;

use fleet::coordination::{Assignment, NewTask, Refusal, Router};
use fleet::core::{AgentId, Role, TaskResult, TaskStatus};
use fleet::store::TaskQueueFile;

use crate::fixtures::TempStore;

/// Test: Rebuild determinism
/// Given a log with creations, assignments, updates and registrations
/// When the projections are rebuilt twice
/// Then both rebuilds produce identical task and agent tables
#[test]
fn test_rebuild_is_deterministic() {
    let store = TempStore::new();
    let coord = &store.coordinator;

    let agent = AgentId::from("discovery-agent-a");
    assert_ok!(coord.register_agent(&agent, Role::Discovery, 100));
    let first = assert_ok!(coord.create_task(NewTask::new("search", "first")));
    let second = assert_ok!(coord.create_task(NewTask::new("implement", "second").priority(1)));
    assert!(coord.assign_task(first, &agent).unwrap().is_assigned());
    assert!(coord
        .update_task_status(first, TaskStatus::Completed, Some(TaskResult::success("x")), Some(agent.clone()))
        .unwrap()
        .is_applied());
    assert!(coord
        .update_task_status(second, TaskStatus::Cancelled, None, None)
        .unwrap()
        .is_applied());

    let read = |name: &str| -> TaskQueueFile {
        serde_json::from_str(&std::fs::read_to_string(store.file(name)).unwrap()).unwrap()
    };

    assert!(coord.repair_state().unwrap());
    let once = read("task-queue.json");
    let agents_once = coord.agents().unwrap();
    assert!(coord.repair_state().unwrap());
    let twice = read("task-queue.json");

    assert_eq!(once.tasks, twice.tasks);
    assert_eq!(once.version, twice.version);
    assert_eq!(once.version, 6);
    assert_eq!(agents_once, coord.agents().unwrap());

    let replayed = coord.store().replay().unwrap();
    assert_eq!(replayed.tasks, twice.tasks);
}

/// Test: Id uniqueness under concurrency
/// Given several threads creating tasks against the same store
/// When all creations finish
/// Then every id is distinct and every task is in the log and projection
#[test]
fn test_concurrent_creates_yield_unique_ids() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 10;

    let store = TempStore::new();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let coord = store.coordinator.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|n| {
                        coord
                            .create_task(NewTask::new("analyze", format!("t{} n{}", t, n)))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(ids.len(), THREADS * PER_THREAD);
    assert_eq!(unique.len(), ids.len());

    let tasks = store.coordinator.tasks().unwrap();
    assert_eq!(tasks.len(), ids.len());
    let log = std::fs::read_to_string(store.file("event-log.jsonl")).unwrap();
    assert_eq!(log.lines().count(), ids.len());

    // Creation order in the projection follows log order.
    let seqs: Vec<u64> = tasks.iter().map(|t| t.created_seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted);
}

/// Test: Dependency gating
/// Given a task depending on an unfinished task
/// When assignment is attempted repeatedly
/// Then it is refused until the dependency completes, then succeeds
#[test]
fn test_dependency_gates_assignment() {
    let store = TempStore::new();
    let coord = &store.coordinator;
    let agent = AgentId::from("generation-agent-a");

    let parent = coord.create_task(NewTask::new("search", "parent")).unwrap();
    let child = coord
        .create_task(NewTask::new("implement", "child").depends_on(parent))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(
            coord.assign_task(child, &agent).unwrap(),
            Assignment::Refused(Refusal::DependencyUnsatisfied(parent))
        );
    }
    assert!(coord.ready_tasks(Role::Generation).unwrap().is_empty());
    assert_eq!(coord.available_tasks(Role::Generation).unwrap().len(), 1);
    assert_eq!(coord.task(child).unwrap().unwrap().status, TaskStatus::Pending);

    let other = AgentId::from("discovery-agent-a");
    assert!(coord.assign_task(parent, &other).unwrap().is_assigned());
    coord
        .update_task_status(parent, TaskStatus::InProgress, None, None)
        .unwrap();
    assert!(!coord.assign_task(child, &agent).unwrap().is_assigned());

    coord
        .update_task_status(parent, TaskStatus::Completed, Some(TaskResult::success("ok")), None)
        .unwrap();
    assert_eq!(coord.ready_tasks(Role::Generation).unwrap().len(), 1);
    assert!(coord.assign_task(child, &agent).unwrap().is_assigned());
    assert_eq!(
        coord.task(child).unwrap().unwrap().assigned_to,
        Some(agent)
    );
}

/// Test: Mutual exclusion on assignment
/// Given many threads claiming the same pending task
/// When they race
/// Then exactly one wins and the projection names the winner
#[test]
fn test_racing_assignments_have_one_winner() {
    const CONTENDERS: usize = 8;

    let store = TempStore::new();
    let task = store
        .coordinator
        .create_task(NewTask::new("review", "contested"))
        .unwrap();

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|n| {
            let coord = store.coordinator.clone();
            thread::spawn(move || {
                let agent = AgentId::new(format!("review-agent-{}", n));
                let outcome = coord.assign_task(task, &agent).unwrap();
                (agent, outcome)
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_assigned())
        .map(|(agent, _)| agent.clone())
        .collect();
    assert_eq!(winners.len(), 1);

    for (_, outcome) in outcomes.iter().filter(|(_, o)| !o.is_assigned()) {
        assert_eq!(
            outcome,
            &Assignment::Refused(Refusal::NotPending(TaskStatus::Assigned))
        );
    }
    let task = store.coordinator.task(task).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_to, Some(winners[0].clone()));

    let assigned_events = std::fs::read_to_string(store.file("event-log.jsonl"))
        .unwrap()
        .lines()
        .filter(|line| line.contains("\"task_assigned\""))
        .count();
    assert_eq!(assigned_events, 1);
}

/// Test: Corruption recovery
/// Given projection files overwritten with garbage
/// When the state is repaired
/// Then the projections match a replay of the log alone
#[test]
fn test_repair_restores_corrupt_projections() {
    let store = TempStore::new();
    let coord = &store.coordinator;
    let agent = AgentId::from("discovery-agent-a");
    coord.register_agent(&agent, Role::Discovery, 7).unwrap();
    let id = coord.create_task(NewTask::new("find", "needle")).unwrap();
    coord.assign_task(id, &agent).unwrap();

    let expected = coord.store().replay().unwrap();
    std::fs::write(store.file("task-queue.json"), "{ not json").unwrap();
    std::fs::write(store.file("agent-registry.json"), "").unwrap();
    assert!(!coord.is_healthy());

    assert!(coord.repair_state().unwrap());
    assert!(coord.is_healthy());
    let tasks: BTreeMap<_, _> = coord.tasks().unwrap().into_iter().map(|t| (t.id, t)).collect();
    assert_eq!(tasks, expected.tasks);
    assert_eq!(
        coord.agent(&agent).unwrap().map(|a| a.pid),
        Some(7)
    );
}

/// Test: Reads heal a deleted projection
/// Given a task queue file that was deleted
/// When tasks are read
/// Then the file is rebuilt from the log
#[test]
fn test_read_heals_missing_projection() {
    let store = TempStore::new();
    let id = store
        .coordinator
        .create_task(NewTask::new("audit", "deps"))
        .unwrap();
    std::fs::remove_file(store.file("task-queue.json")).unwrap();

    assert_eq!(store.coordinator.task(id).unwrap().map(|t| t.id), Some(id));
    assert!(store.file("task-queue.json").exists());
}

/// Test: Torn trailing record
/// Given a log whose last line was cut off mid-write
/// When the next event is appended
/// Then the torn record is dropped and the log stays readable
#[test]
fn test_torn_tail_is_healed_on_append() {
    let store = TempStore::new();
    let first = store
        .coordinator
        .create_task(NewTask::new("search", "before crash"))
        .unwrap();

    let mut log = OpenOptions::new()
        .append(true)
        .open(store.file("event-log.jsonl"))
        .unwrap();
    log.write_all(br#"{"id":"7d1f","timestamp":"2026-"#).unwrap();
    drop(log);

    // Replay tolerates the torn tail.
    assert_eq!(store.coordinator.store().replay().unwrap().tasks.len(), 1);

    let second = store
        .coordinator
        .create_task(NewTask::new("search", "after crash"))
        .unwrap();
    let content = std::fs::read_to_string(store.file("event-log.jsonl")).unwrap();
    assert_eq!(content.lines().count(), 2);
    assert!(content.ends_with('\n'));

    let ids: Vec<_> = store.coordinator.tasks().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first, second]);
}

/// Test: Record torn inside a multibyte character
/// Given a log whose last line was cut between the bytes of a non-ASCII
/// character
/// When the state is repaired and read
/// Then the torn record is skipped and the earlier task survives
#[test]
fn test_repair_survives_tail_cut_mid_character() {
    let store = TempStore::new();
    let first = store
        .coordinator
        .create_task(NewTask::new("search", "before crash"))
        .unwrap();

    let torn = r#"{"id":"7d1f","timestamp":"2026-01-01T00:00:00Z","type":"task_created","data":{"description":"é"#;
    let bytes = torn.as_bytes();
    let mut log = OpenOptions::new()
        .append(true)
        .open(store.file("event-log.jsonl"))
        .unwrap();
    log.write_all(&bytes[..bytes.len() - 1]).unwrap();
    drop(log);

    assert!(assert_ok!(store.coordinator.repair_state()));
    let ids: Vec<_> = store.coordinator.tasks().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first]);
}

/// Test: Explicit routing table
/// Given a routing entry for a type no keyword matches
/// When a task of that type is created
/// Then it is accepted and routed to the configured role
#[test]
fn test_explicit_routing_entry() {
    let routing: BTreeMap<String, Role> = [("Triage".to_string(), Role::Review)].into_iter().collect();
    let store = TempStore::with_routing(Router::new(&routing));

    let id = store
        .coordinator
        .create_task(NewTask::new("triage", "incoming bug"))
        .unwrap();
    let review = store.coordinator.available_tasks(Role::Review).unwrap();
    assert_eq!(review.iter().map(|t| t.id).collect::<Vec<_>>(), vec![id]);
    assert!(store.coordinator.create_task(NewTask::new("paint", "x")).is_err());
}

/// Test: Overlapping task types
/// Given task types that contain keywords of two roles
/// When each role asks for available work
/// Then both roles see them, and once one role's worker claims a task it
/// disappears for the other
#[test]
fn test_overlapping_types_offered_to_each_matching_role() {
    let store = TempStore::new();
    let coord = &store.coordinator;
    let review_fix = coord.create_task(NewTask::new("code_review", "pr 12")).unwrap();
    let sec_fix = coord.create_task(NewTask::new("security_fix", "cve")).unwrap();
    let plain = coord.create_task(NewTask::new("audit", "deps")).unwrap();

    let ids = |role| -> Vec<_> {
        coord.available_tasks(role).unwrap().iter().map(|t| t.id).collect()
    };
    assert_eq!(ids(Role::Review), vec![review_fix, sec_fix, plain]);
    assert_eq!(ids(Role::Generation), vec![review_fix, sec_fix]);
    assert!(ids(Role::Discovery).is_empty());

    let reviewer = AgentId::from("review-agent-1");
    assert!(coord.assign_task(review_fix, &reviewer).unwrap().is_assigned());
    assert_eq!(ids(Role::Generation), vec![sec_fix]);
}

/// Test: End-to-end lifecycle
/// Given lower-priority discovery work created earlier
/// When a priority 1 search task is created, claimed, started and completed
/// Then it is offered first and the projection records its result
#[test]
fn test_task_lifecycle_end_to_end() {
    let store = TempStore::new();
    let coord = &store.coordinator;

    let low = coord.create_task(NewTask::new("analyze", "later").priority(3)).unwrap();
    let normal = coord.create_task(NewTask::new("investigate", "soon").priority(2)).unwrap();
    let urgent = coord.create_task(NewTask::new("search", "now").priority(1)).unwrap();

    let offered: Vec<_> = coord
        .available_tasks(Role::Discovery)
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(offered, vec![urgent, normal, low]);

    let a1 = AgentId::from("a1");
    assert!(coord.register_agent(&a1, Role::Discovery, 4321).unwrap().is_applied());
    assert!(coord.assign_task(urgent, &a1).unwrap().is_assigned());
    assert!(coord
        .update_task_status(urgent, TaskStatus::InProgress, None, Some(a1.clone()))
        .unwrap()
        .is_applied());
    assert!(coord
        .update_task_status(
            urgent,
            TaskStatus::Completed,
            Some(TaskResult::success("x")),
            Some(a1.clone())
        )
        .unwrap()
        .is_applied());

    let task = coord.task(urgent).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        task.result.as_ref().and_then(|r| r.output()),
        Some(&serde_json::json!("x"))
    );
    assert_eq!(coord.agent(&a1).unwrap().unwrap().tasks_completed, 1);

    // Terminal tasks accept no further updates.
    assert!(!coord
        .update_task_status(urgent, TaskStatus::Failed, None, None)
        .unwrap()
        .is_applied());

    let summary = coord.summary().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.pending_by_role.get(&Role::Discovery), Some(&2));
    assert_eq!(summary.agents, 1);
}
