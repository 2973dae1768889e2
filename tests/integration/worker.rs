//! Worker client integration tests.
//!
//! These tests run discovery and generation workers against one store and
//! check that work and results flow between them.

use std::cell::RefCell;

use fleet::coordination::NewTask;
use fleet::core::{AgentId, FollowUpTask, Priority, Role, Task, TaskResult, TaskStatus};
use fleet::worker::{TaskExecutor, WorkOptions, WorkerClient};
use fleet::Result;

use crate::fixtures::TempStore;

/// Emits one follow-up per discovery task.
struct Planner;

impl TaskExecutor for Planner {
    fn execute(&self, task: &Task, _client: &WorkerClient) -> Result<TaskResult> {
        Ok(TaskResult::Success {
            output: serde_json::json!({ "found": task.description }),
            next_tasks: vec![FollowUpTask {
                task_type: "implement".to_string(),
                description: format!("build {}", task.description),
                priority: Priority::HIGH,
            }],
        })
    }
}

/// Records the dependency results each task sees.
#[derive(Default)]
struct Builder {
    seen: RefCell<Vec<TaskResult>>,
}

impl TaskExecutor for Builder {
    fn execute(&self, task: &Task, client: &WorkerClient) -> Result<TaskResult> {
        let inputs = client.dependency_results(task)?;
        self.seen.borrow_mut().extend(inputs.into_values());
        Ok(TaskResult::success("built"))
    }
}

fn options() -> WorkOptions {
    WorkOptions {
        poll_interval: std::time::Duration::from_millis(1),
        ..WorkOptions::default()
    }
}

/// Test: Follow-up chain across roles
/// Given a discovery task whose result lists an implementation follow-up
/// When a discovery worker and then a generation worker drain the queue
/// Then the follow-up runs after its parent and sees the parent's result
#[test]
fn test_follow_up_flows_to_generation_worker() {
    let store = TempStore::new();
    let discovery = WorkerClient::new(
        store.coordinator.clone(),
        AgentId::from("discovery-agent-1"),
        Role::Discovery,
    );
    let generation = WorkerClient::new(
        store.coordinator.clone(),
        AgentId::from("generation-agent-1"),
        Role::Generation,
    );
    assert!(discovery.register(1).unwrap().is_applied());
    assert!(generation.register(2).unwrap().is_applied());

    let root = store
        .coordinator
        .create_task(NewTask::new("discover", "parser"))
        .unwrap();

    // Nothing for generation yet.
    let builder = Builder::default();
    assert_eq!(generation.work(&builder, &options()).unwrap().total(), 0);

    let report = discovery.work(&Planner, &options()).unwrap();
    assert_eq!(report.completed, 1);

    let report = generation.work(&builder, &options()).unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(
        builder.seen.borrow().as_slice(),
        &[TaskResult::Success {
            output: serde_json::json!({ "found": "parser" }),
            next_tasks: vec![FollowUpTask {
                task_type: "implement".to_string(),
                description: "build parser".to_string(),
                priority: Priority::HIGH,
            }],
        }]
    );

    let tasks = store.coordinator.tasks().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(tasks[1].dependencies.contains(&root));
    assert_eq!(
        tasks[1].assigned_to.as_ref().map(|a| a.as_str()),
        Some("generation-agent-1")
    );

    let agents = store.coordinator.agents().unwrap();
    assert!(agents.iter().all(|a| a.tasks_completed == 1 && a.tasks_failed == 0));
}

/// Test: Worker picks up supervisor assignments
/// Given a task the supervisor already assigned to this worker
/// When the worker polls for work
/// Then it runs that task instead of claiming a new one
#[test]
fn test_worker_runs_task_assigned_by_supervisor() {
    let store = TempStore::new();
    let agent = AgentId::from("generation-agent-1");
    let worker = WorkerClient::new(store.coordinator.clone(), agent.clone(), Role::Generation);
    worker.register(3).unwrap();

    let coord = &store.coordinator;
    let open = coord.create_task(NewTask::new("fix", "open").priority(1)).unwrap();
    let mine = coord.create_task(NewTask::new("refactor", "mine").priority(3)).unwrap();
    assert!(coord.assign_task(mine, &agent).unwrap().is_assigned());

    let options = WorkOptions {
        max_tasks: Some(1),
        ..options()
    };
    assert_eq!(worker.work(&Builder::default(), &options).unwrap().completed, 1);
    assert_eq!(coord.task(mine).unwrap().unwrap().status, TaskStatus::Completed);
    assert_eq!(coord.task(open).unwrap().unwrap().status, TaskStatus::Pending);
}
