//! The background loops against a real store.

mod common;

use std::time::Duration;

use common::{test_config, Harness, MockDispatcher, Script};
use crown::{Agent, AgentStatus, RuntimeState, SchedulerStore, Task, TaskStatus};

async fn wait_for_status(
    store: &dyn SchedulerStore,
    task: &Task,
    status: TaskStatus,
    limit: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(current)) = store.get_task(task.id).await {
            if current.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_loops_assign_and_apply_completion() {
    common::setup_test_logging();
    let mut config = test_config();
    config.scheduler.tick_interval_secs = 1;
    let dispatcher = MockDispatcher::with_scripts([Script::Succeed(None)]);
    let harness = Harness::new(&config, dispatcher).await;

    let agent = Agent::new("build");
    harness.store.create_agent(&agent).await.unwrap();
    let task = Task::new("TASK-1", "feature");
    harness.store.create_task(&task).await.unwrap();

    harness.runtime.start().await.unwrap();
    assert_eq!(harness.runtime.state().await, RuntimeState::Running);

    let completed = wait_for_status(
        harness.store.as_ref(),
        &task,
        TaskStatus::Completed,
        Duration::from_secs(10),
    )
    .await;
    assert!(completed, "task was never completed");

    harness.runtime.stop().await.unwrap();
    assert_eq!(harness.runtime.state().await, RuntimeState::Stopped);

    let agent = harness.store.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_dry_run_keeps_tasks_pending() {
    let mut config = test_config();
    config.scheduler.tick_interval_secs = 1;
    let harness = Harness::new(&config, MockDispatcher::new()).await;
    harness.runtime.controls().set_spawning_enabled(false);

    harness.store.create_agent(&Agent::new("build")).await.unwrap();
    let task = Task::new("TASK-2", "feature");
    harness.store.create_task(&task).await.unwrap();

    harness.runtime.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    harness.runtime.stop().await.unwrap();

    let task = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(harness.dispatcher.requests().is_empty());
    assert!(harness.runtime.tick_scheduler().ticks() >= 1);
}

#[tokio::test]
async fn test_reports_cannot_be_drained_while_running() {
    let harness = Harness::new(&test_config(), MockDispatcher::new()).await;
    assert_eq!(harness.runtime.drain_reports().await.unwrap(), 0);

    harness.runtime.start().await.unwrap();
    assert!(harness.runtime.drain_reports().await.is_err());
    harness.runtime.stop().await.unwrap();
}
