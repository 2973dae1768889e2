//! Supervisor integration tests.
//!
//! These tests drive health and distribution cycles by hand against a mock
//! launcher, so crashes and heartbeats can be staged precisely.

use std::sync::atomic::Ordering;
use std::time::Duration;

use fleet::coordination::NewTask;
use fleet::core::{Role, TaskStatus};
use fleet::orchestration::launcher::{ENV_AGENT_ROLE, ENV_COORDINATION_PATH};
use fleet::orchestration::{Supervisor, WorkerStatus};
use fleet::Error;

use crate::fixtures::{launched_roles, MockLauncher, TempStore};

fn supervisor(store: &TempStore, launcher: &std::sync::Arc<MockLauncher>) -> Supervisor {
    supervisor_with(store, launcher, |_| {})
}

fn supervisor_with(
    store: &TempStore,
    launcher: &std::sync::Arc<MockLauncher>,
    tweak: impl FnOnce(&mut fleet::Config),
) -> Supervisor {
    let mut config = store.config();
    tweak(&mut config);
    Supervisor::new(config, store.coordinator.clone(), launcher.clone())
}

/// Test: Bounded restart
/// Given a worker whose process keeps dying
/// When the health loop runs after each death
/// Then it is relaunched max_restarts times and then stopped for good
#[tokio::test]
async fn test_restarts_are_bounded() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor(&store, &launcher);

    let first = sup.spawn_worker(Role::Discovery).await.unwrap();
    assert_eq!(launcher.spawn_count(), 1);

    for restart in 1..=3u32 {
        launcher.kill_all();
        sup.check_health().await.unwrap();
        assert_eq!(launcher.spawn_count(), 1 + restart as usize);

        let status = sup.status().await.unwrap();
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.workers[0].restart_count, restart);
        assert_eq!(status.workers[0].status, WorkerStatus::Active);
        assert_ne!(status.workers[0].agent_id, first);
    }

    launcher.kill_all();
    sup.check_health().await.unwrap();
    assert_eq!(launcher.spawn_count(), 4);

    let status = sup.status().await.unwrap();
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].status, WorkerStatus::Stopped);
    assert_eq!(status.workers[0].restart_count, 3);
    assert_eq!(status.roles[&Role::Discovery].stopped, 1);
    assert_eq!(status.roles[&Role::Discovery].live, 0);

    // A stopped worker is never looked at again.
    sup.check_health().await.unwrap();
    sup.check_health().await.unwrap();
    assert_eq!(launcher.spawn_count(), 4);
}

/// Test: Operator retires a stopped worker
/// Given a role whose only slot is held by a permanently stopped worker
/// When the operator retires that worker
/// Then the slot is free and a new worker can be spawned
#[tokio::test]
async fn test_retiring_stopped_worker_frees_slot() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor_with(&store, &launcher, |config| {
        config.max_restarts = 0;
    });

    sup.spawn_worker(Role::Review).await.unwrap();
    launcher.kill_all();
    sup.check_health().await.unwrap();
    let stopped = sup.status().await.unwrap().workers[0].clone();
    assert_eq!(stopped.status, WorkerStatus::Stopped);
    assert!(matches!(
        sup.spawn_worker(Role::Review).await,
        Err(Error::WorkerSpawn(_))
    ));

    sup.retire_worker(&stopped.agent_id).await.unwrap();
    assert!(matches!(
        sup.retire_worker(&stopped.agent_id).await,
        Err(Error::WorkerNotFound { .. })
    ));
    sup.spawn_worker(Role::Review).await.unwrap();
    assert_eq!(launcher.spawn_count(), 2);
}

/// Test: Failed replacement
/// Given a worker that crashes while launches are failing
/// When the health loop tries to replace it
/// Then the old record stays as an error carrying the spent restart
#[tokio::test]
async fn test_failed_relaunch_keeps_error_record() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor(&store, &launcher);

    let id = sup.spawn_worker(Role::Generation).await.unwrap();
    launcher.refuse.store(true, Ordering::SeqCst);
    launcher.kill_all();
    sup.check_health().await.unwrap();

    let status = sup.status().await.unwrap();
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].agent_id, id);
    assert_eq!(status.workers[0].status, WorkerStatus::Error);
    assert_eq!(status.workers[0].restart_count, 1);

    // The next cycle retries and succeeds.
    launcher.refuse.store(false, Ordering::SeqCst);
    sup.check_health().await.unwrap();
    let status = sup.status().await.unwrap();
    assert_eq!(status.workers[0].status, WorkerStatus::Active);
    assert_eq!(status.workers[0].restart_count, 2);
}

/// Test: Spawn failure
/// Given a launcher whose processes exit during the grace period
/// When a worker is spawned
/// Then the spawn is reported and no worker is recorded
#[tokio::test]
async fn test_worker_dying_at_startup_is_not_recorded() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    launcher.die_on_start.store(true, Ordering::SeqCst);
    let sup = supervisor(&store, &launcher);

    let result = sup.spawn_worker(Role::Discovery).await;
    assert!(matches!(result, Err(Error::WorkerSpawn(_))));
    assert!(sup.status().await.unwrap().workers.is_empty());
}

/// Test: Worker limit
/// Given a role at its configured maximum
/// When another worker is requested
/// Then the spawn is refused without launching anything
#[tokio::test]
async fn test_spawn_respects_max_workers() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor(&store, &launcher);

    sup.spawn_worker(Role::Review).await.unwrap();
    assert!(matches!(
        sup.spawn_worker(Role::Review).await,
        Err(Error::WorkerSpawn(_))
    ));
    assert_eq!(launcher.spawn_count(), 1);

    let spec = &launcher.specs()[0];
    assert_eq!(spec.env_var(ENV_AGENT_ROLE), Some("review"));
    assert_eq!(
        spec.env_var(ENV_COORDINATION_PATH),
        Some(store.path().display().to_string().as_str())
    );
    assert!(spec.workdir.ends_with("agent-workspaces/review-agent"));
    assert!(spec.workdir.is_dir());
}

/// Test: Auto-start on pending work
/// Given pending discovery work and no discovery workers
/// When the distribution loop runs
/// Then one discovery worker is started and receives the task next cycle
#[tokio::test]
async fn test_distribution_starts_worker_for_pending_role() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor(&store, &launcher);

    let id = store
        .coordinator
        .create_task(NewTask::new("search", "entry points"))
        .unwrap();
    sup.distribute().await.unwrap();
    assert_eq!(launched_roles(&launcher), vec![Role::Discovery]);
    assert_eq!(
        store.coordinator.task(id).unwrap().unwrap().status,
        TaskStatus::Pending
    );

    sup.distribute().await.unwrap();
    let task = store.coordinator.task(id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_to, Some(launcher.handles()[0].agent_id.clone()));
    assert_eq!(launcher.spawn_count(), 1);

    let status = sup.status().await.unwrap();
    assert_eq!(status.roles[&Role::Discovery].busy, 1);
}

/// Test: Review is never auto-started
/// Given pending review work and no review workers
/// When the distribution loop runs
/// Then no review worker is launched and the work stays pending
#[tokio::test]
async fn test_review_role_is_not_auto_started() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor(&store, &launcher);

    store
        .coordinator
        .create_task(NewTask::new("security", "audit auth"))
        .unwrap();
    sup.distribute().await.unwrap();
    sup.distribute().await.unwrap();

    assert_eq!(launcher.spawn_count(), 0);
    let status = sup.status().await.unwrap();
    assert_eq!(status.roles[&Role::Review].pending, 1);
    assert_eq!(status.roles[&Role::Review].live, 0);
}

/// Test: One task per free worker, in priority order
/// Given two idle discovery workers and three ready tasks
/// When the distribution loop runs
/// Then the two highest-priority tasks go to different workers
#[tokio::test]
async fn test_distribution_assigns_one_task_per_free_worker() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor(&store, &launcher);
    sup.spawn_worker(Role::Discovery).await.unwrap();
    sup.spawn_worker(Role::Discovery).await.unwrap();

    let coord = &store.coordinator;
    let low = coord.create_task(NewTask::new("search", "low").priority(3)).unwrap();
    let high = coord.create_task(NewTask::new("search", "high").priority(1)).unwrap();
    let normal = coord.create_task(NewTask::new("search", "normal").priority(2)).unwrap();

    sup.distribute().await.unwrap();

    let high_task = coord.task(high).unwrap().unwrap();
    let normal_task = coord.task(normal).unwrap().unwrap();
    assert_eq!(high_task.status, TaskStatus::Assigned);
    assert_eq!(normal_task.status, TaskStatus::Assigned);
    assert_ne!(high_task.assigned_to, normal_task.assigned_to);
    assert_eq!(coord.task(low).unwrap().unwrap().status, TaskStatus::Pending);

    // Both workers are busy and the role is at its limit.
    sup.distribute().await.unwrap();
    assert_eq!(coord.task(low).unwrap().unwrap().status, TaskStatus::Pending);
    assert_eq!(launcher.spawn_count(), 2);
    assert_eq!(sup.status().await.unwrap().roles[&Role::Discovery].busy, 2);

    // Finishing a task frees its worker for the next cycle.
    let worker = high_task.assigned_to.unwrap();
    coord
        .update_task_status(high, TaskStatus::Completed, None, Some(worker.clone()))
        .unwrap();
    sup.distribute().await.unwrap();
    assert_eq!(coord.task(low).unwrap().unwrap().assigned_to, Some(worker));
}

/// Test: Scale-up
/// Given one generation worker and more pending work than workers
/// When the distribution loop runs
/// Then one more generation worker is started, up to the role maximum
#[tokio::test]
async fn test_distribution_scales_up_to_max() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor_with(&store, &launcher, |config| {
        if let Some(role) = config.roles.get_mut("generation") {
            role.max_workers = 3;
        }
    });
    sup.spawn_worker(Role::Generation).await.unwrap();
    for n in 0..5 {
        store
            .coordinator
            .create_task(NewTask::new("implement", format!("feature {}", n)))
            .unwrap();
    }

    sup.distribute().await.unwrap();
    assert_eq!(launcher.spawn_count(), 2);
    sup.distribute().await.unwrap();
    assert_eq!(launcher.spawn_count(), 3);
    sup.distribute().await.unwrap();
    assert_eq!(launcher.spawn_count(), 3);

    let status = sup.status().await.unwrap();
    assert_eq!(status.roles[&Role::Generation].running, 3);
    assert_eq!(status.roles[&Role::Generation].busy, 3);
    assert_eq!(status.roles[&Role::Generation].pending, 2);
}

/// Test: Heartbeat staleness
/// Given a worker whose in-memory heartbeat is old
/// When the registry holds a fresh heartbeat the health loop re-checks it
/// Then the worker is only restarted once the registry is stale too
#[tokio::test]
async fn test_stale_worker_is_rechecked_against_registry() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor_with(&store, &launcher, |config| {
        config.heartbeat_timeout_secs = 1;
    });

    let id = sup.spawn_worker(Role::Discovery).await.unwrap();
    store
        .coordinator
        .register_agent(&id, Role::Discovery, launcher.handles()[0].pid)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    store.coordinator.heartbeat(&id, None).unwrap();
    sup.check_health().await.unwrap();
    assert_eq!(launcher.spawn_count(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    sup.check_health().await.unwrap();
    assert_eq!(launcher.spawn_count(), 2);

    let old = launcher.handle(&id).unwrap();
    assert!(old.was_terminated());
    assert!(!old.is_alive());
}

/// Test: Startup and shutdown
/// Given a supervisor with initial workers configured
/// When it is started and then shut down
/// Then the initial workers run, and afterwards every one is stopped
#[tokio::test]
async fn test_start_then_shutdown_stops_everything() {
    let store = TempStore::new();
    let launcher = MockLauncher::new();
    let sup = supervisor_with(&store, &launcher, |config| {
        for (name, role) in config.roles.iter_mut() {
            role.initial_workers = if name == "review" { 0 } else { 1 };
        }
    });

    // Startup repair rebuilds a deleted projection.
    store.coordinator.create_task(NewTask::new("analyze", "repo")).unwrap();
    std::fs::remove_file(store.file("agent-registry.json")).unwrap();

    sup.start().await.unwrap();
    assert!(store.coordinator.is_healthy());
    let mut roles = launched_roles(&launcher);
    roles.sort();
    assert_eq!(roles, vec![Role::Discovery, Role::Generation]);
    assert_eq!(launcher.live().len(), 2);

    sup.shutdown().await;
    assert!(launcher.live().is_empty());
    assert!(launcher.handles().iter().all(|h| h.was_terminated()));

    let status = sup.status().await.unwrap();
    assert!(status
        .workers
        .iter()
        .all(|w| w.status == WorkerStatus::Stopped));
    assert_eq!(status.roles[&Role::Discovery].stopped, 1);
    assert!(status.coordination_healthy);
}
