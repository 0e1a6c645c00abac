//! Task assignment.
//!
//! Matches pending tasks to idle agents once per tick. The store's conditional
//! claim is the only serialization point; everything around it tolerates
//! losing the race.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Agent, AgentAssignment, SchedulerConfig, Session, Task, TaskPatch, TaskStatus, WaveRunStatus,
};
use crate::domain::ports::{
    DispatchFailure, DispatchHandle, ProductionGate, SchedulerStore, SpawnRequest, TaskFilter,
    WorkerDispatcher, WorkerOutcome, WorkerReport,
};
use crate::services::completion::CompletionHandler;
use crate::services::controls::ControlFlags;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::retry_cooldown::RetryCooldown;

/// Dispatches pending tasks to idle agents.
///
/// Each dispatched worker gets a forwarder task that sends its
/// [`WorkerReport`] to the tick loop's report channel.
pub struct TaskAssignmentEngine {
    store: Arc<dyn SchedulerStore>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    gate: Arc<dyn ProductionGate>,
    cooldown: Arc<RetryCooldown>,
    events: Arc<EventBus>,
    completion: Arc<CompletionHandler>,
    reports: mpsc::Sender<WorkerReport>,
    controls: ControlFlags,
    config: SchedulerConfig,
}

impl TaskAssignmentEngine {
    /// Engine reporting completions on `reports`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        gate: Arc<dyn ProductionGate>,
        cooldown: Arc<RetryCooldown>,
        events: Arc<EventBus>,
        completion: Arc<CompletionHandler>,
        reports: mpsc::Sender<WorkerReport>,
        controls: ControlFlags,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gate,
            cooldown,
            events,
            completion,
            reports,
            controls,
            config,
        }
    }

    /// Run one assignment cycle as of the current time.
    pub async fn assign(&self) -> DomainResult<usize> {
        self.assign_at(Utc::now()).await
    }

    /// Run one assignment cycle and return how many tasks were dispatched.
    pub async fn assign_at(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        if !self.controls.spawning_enabled() {
            debug!("spawning disabled, skipping assignment");
            return Ok(0);
        }

        let pending = self.store.get_tasks(TaskFilter::status(TaskStatus::Pending)).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        // Task list -> wave currently open for it
        let open_waves: HashMap<Uuid, u32> = self
            .store
            .get_wave_runs(Some(WaveRunStatus::Running))
            .await?
            .into_iter()
            .map(|run| (run.task_list_id, run.current_wave))
            .collect();

        let mut candidates = Vec::with_capacity(pending.len());
        for task in pending {
            if self.gate.is_excluded(&task) {
                continue;
            }
            if waits_for_earlier_wave(&task, &open_waves) {
                debug!(task_id = %task.id, wave = ?task.wave_number, "task waits for its wave");
                continue;
            }
            if !self.cooldown.is_eligible(&task, now).await {
                debug!(task_id = %task.id, retry_count = task.retry_count, "task cooling down");
                continue;
            }
            candidates.push(task);
        }
        // Stable: equal priorities keep arrival order.
        candidates.sort_by_key(|t| t.priority);

        let mut pool: Vec<Agent> = self
            .store
            .get_idle_agents()
            .await?
            .into_iter()
            .filter(|a| self.config.assignable_agent_types.contains(&a.agent_type))
            .collect();

        let mut assigned = 0;
        for task in candidates {
            if pool.is_empty() {
                break;
            }
            let Some(index) = self.pick_agent(&task, &pool) else {
                continue;
            };
            let agent_id = pool[index].id;

            match self.store.claim_task(task.id, agent_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task_id = %task.id, "claim lost to another assigner");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "claim failed, treating as not claimed");
                    continue;
                }
            }

            let agent = pool.remove(index);
            let request = SpawnRequest::Task {
                task_id: task.id,
                agent_id,
            };
            match self.dispatcher.spawn(request).await {
                Ok(handle) => {
                    self.on_started(&task, &agent, handle, now).await;
                    assigned += 1;
                }
                Err(failure) => self.on_dispatch_failure(&task, &agent, failure, now).await,
            }
        }

        if assigned > 0 {
            info!(assigned, "tasks dispatched");
        }
        Ok(assigned)
    }

    /// Preferred type for the category, then the fallback type, then anyone.
    fn pick_agent(&self, task: &Task, pool: &[Agent]) -> Option<usize> {
        let by_type = |agent_type: &str| pool.iter().position(|a| a.agent_type == agent_type);
        self.config
            .agent_type_preferences
            .get(&task.category.to_lowercase())
            .and_then(|t| by_type(t))
            .or_else(|| by_type(&self.config.fallback_agent_type))
            .or(if pool.is_empty() { None } else { Some(0) })
    }

    async fn on_started(
        &self,
        task: &Task,
        agent: &Agent,
        handle: DispatchHandle,
        now: DateTime<Utc>,
    ) {
        let session_id = handle.session_id;
        let session = Session::start(session_id, agent.id, task.id, now);
        if let Err(e) = self.store.create_session(&session).await {
            warn!(%session_id, error = %e, "failed to record session");
        }
        let working = AgentAssignment::Working {
            task_id: task.id,
            session_id,
        };
        if let Err(e) = self.store.update_agent_status_at(agent.id, working, now).await {
            warn!(agent_id = %agent.id, error = %e, "failed to mark agent working");
        }

        info!(
            task_id = %task.id,
            display_id = %task.display_id,
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            %session_id,
            "task assigned"
        );
        self.events.publish(EventPayload::TaskAssigned {
            task_id: task.id,
            display_id: task.display_id.clone(),
            agent_id: agent.id,
            session_id,
        });

        let reports = self.reports.clone();
        let (task_id, agent_id) = (task.id, agent.id);
        tokio::spawn(async move {
            let outcome = handle.completion.await.unwrap_or_else(|_| WorkerOutcome::Failed {
                error: "worker completion channel closed".to_string(),
                output: None,
            });
            let report = WorkerReport {
                session_id,
                task_id,
                agent_id,
                outcome,
            };
            if reports.send(report).await.is_err() {
                warn!(%session_id, "completion channel closed, report dropped");
            }
        });
    }

    async fn on_dispatch_failure(
        &self,
        task: &Task,
        agent: &Agent,
        failure: DispatchFailure,
        now: DateTime<Utc>,
    ) {
        let Some(session_id) = failure.session_id else {
            warn!(task_id = %task.id, error = %failure.error, "dispatch failed before start, releasing claim");
            let release = TaskPatch::status(TaskStatus::Pending).unassigned();
            if let Err(e) = self.store.update_task(task.id, &release).await {
                warn!(task_id = %task.id, error = %e, "failed to release claim");
            }
            return;
        };

        warn!(task_id = %task.id, %session_id, error = %failure.error, "worker died after start");
        let session = Session::start(session_id, agent.id, task.id, now);
        if let Err(e) = self.store.create_session(&session).await {
            warn!(%session_id, error = %e, "failed to record session");
        }
        let report = WorkerReport {
            session_id,
            task_id: task.id,
            agent_id: agent.id,
            outcome: WorkerOutcome::Failed {
                error: failure.error,
                output: None,
            },
        };
        if let Err(e) = self.completion.handle(report).await {
            warn!(task_id = %task.id, error = %e, "failed to record dispatch failure");
        }
    }
}

/// Whether the task belongs to a later wave of a run still on an earlier one.
fn waits_for_earlier_wave(task: &Task, open_waves: &HashMap<Uuid, u32>) -> bool {
    match (task.task_list_id, task.wave_number) {
        (Some(list), Some(wave)) => open_waves.get(&list).is_some_and(|current| wave > *current),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::models::{AgentStatus, TaskPriority, WaveRun};
    use crate::services::production_gate::CategoryGate;
    use crate::services::test_support::{Script, ScriptedDispatcher};

    struct Harness {
        store: Arc<InMemoryStore>,
        dispatcher: Arc<ScriptedDispatcher>,
        cooldown: Arc<RetryCooldown>,
        controls: ControlFlags,
        engine: TaskAssignmentEngine,
        reports: mpsc::Receiver<WorkerReport>,
    }

    fn harness(scripts: Vec<Script>, gate: CategoryGate) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::with_scripts(scripts));
        let cooldown = Arc::new(RetryCooldown::default());
        let events = Arc::new(EventBus::default());
        let completion = Arc::new(CompletionHandler::new(
            store.clone(),
            cooldown.clone(),
            events.clone(),
        ));
        let (tx, rx) = mpsc::channel(16);
        let controls = ControlFlags::default();
        let engine = TaskAssignmentEngine::new(
            store.clone(),
            dispatcher.clone(),
            Arc::new(gate),
            cooldown.clone(),
            events,
            completion,
            tx,
            controls.clone(),
            SchedulerConfig::default(),
        );
        Harness {
            store,
            dispatcher,
            cooldown,
            controls,
            engine,
            reports: rx,
        }
    }

    #[tokio::test]
    async fn test_assigns_by_priority_then_arrival() {
        let h = harness(vec![], CategoryGate::default());
        let low = Task::new("TASK-1", "feature").with_priority(TaskPriority::P3);
        let high = Task::new("TASK-2", "feature").with_priority(TaskPriority::P0);
        h.store.create_task(&low).await.unwrap();
        h.store.create_task(&high).await.unwrap();
        let agent = Agent::new("build");
        h.store.create_agent(&agent).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 1);

        let high = h.store.get_task(high.id).await.unwrap().unwrap();
        assert_eq!(high.status, TaskStatus::InProgress);
        assert_eq!(high.assigned_agent_id, Some(agent.id));
        let low = h.store.get_task(low.id).await.unwrap().unwrap();
        assert_eq!(low.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_prefers_category_agent_type() {
        let h = harness(vec![], CategoryGate::default());
        let task = Task::new("TASK-1", "frontend");
        h.store.create_task(&task).await.unwrap();
        let build = Agent::new("build");
        let frontend = Agent::new("frontend");
        h.store.create_agent(&build).await.unwrap();
        h.store.create_agent(&frontend).await.unwrap();

        h.engine.assign().await.unwrap();

        let task = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.assigned_agent_id, Some(frontend.id));
    }

    #[tokio::test]
    async fn test_supervisory_agents_are_not_assigned() {
        let h = harness(vec![], CategoryGate::default());
        h.store.create_task(&Task::new("TASK-1", "feature")).await.unwrap();
        h.store.create_agent(&Agent::new("crown")).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 0);
        assert!(h.dispatcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_excluded_and_cooling_tasks_are_skipped() {
        let h = harness(vec![], CategoryGate::new(vec!["research".into()], vec![]));
        let excluded = Task::new("TASK-1", "research");
        let mut cooling = Task::new("TASK-2", "feature");
        cooling.retry_count = 1;
        h.store.create_task(&excluded).await.unwrap();
        h.store.create_task(&cooling).await.unwrap();
        h.cooldown.record_failure(cooling.id, Utc::now()).await;
        h.store.create_agent(&Agent::new("build")).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_later_wave_waits_for_current_wave() {
        let h = harness(vec![], CategoryGate::default());
        let list = Uuid::new_v4();
        let first = Task::new("W1-A", "feature").with_wave(list, 1);
        let second = Task::new("W2-A", "feature")
            .with_wave(list, 2)
            .with_priority(TaskPriority::P0);
        h.store.create_task(&first).await.unwrap();
        h.store.create_task(&second).await.unwrap();
        h.store.create_wave_run(&WaveRun::new(list, 2)).await.unwrap();
        h.store.create_agent(&Agent::new("build")).await.unwrap();
        h.store.create_agent(&Agent::new("build")).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 1);

        let first = h.store.get_task(first.id).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::InProgress);
        let second = h.store.get_task(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_wave_tasks_without_running_run_are_assignable() {
        let h = harness(vec![], CategoryGate::default());
        let task = Task::new("W3-A", "feature").with_wave(Uuid::new_v4(), 3);
        h.store.create_task(&task).await.unwrap();
        h.store.create_agent(&Agent::new("build")).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_spawning_disabled_returns_zero() {
        let h = harness(vec![], CategoryGate::default());
        h.store.create_task(&Task::new("TASK-1", "feature")).await.unwrap();
        h.store.create_agent(&Agent::new("build")).await.unwrap();
        h.controls.set_spawning_enabled(false);

        assert_eq!(h.engine.assign().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_before_start_releases_claim() {
        let h = harness(
            vec![Script::FailBeforeStart("spawn refused".into())],
            CategoryGate::default(),
        );
        let task = Task::new("TASK-1", "feature");
        h.store.create_task(&task).await.unwrap();
        let agent = Agent::new("build");
        h.store.create_agent(&agent).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 0);

        let task = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_agent_id, None);
        assert_eq!(task.retry_count, 0);
        let agent = h.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_failure_after_start_counts_as_attempt() {
        let h = harness(
            vec![Script::FailAfterStart("worker crashed".into())],
            CategoryGate::default(),
        );
        let task = Task::new("TASK-1", "feature");
        h.store.create_task(&task).await.unwrap();
        h.store.create_agent(&Agent::new("build")).await.unwrap();

        assert_eq!(h.engine.assign().await.unwrap(), 0);

        let task = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.failure_context.as_deref(), Some("worker crashed"));
    }

    #[tokio::test]
    async fn test_completion_is_forwarded() {
        let mut h = harness(vec![Script::Succeed(None)], CategoryGate::default());
        let task = Task::new("TASK-1", "feature");
        h.store.create_task(&task).await.unwrap();
        let agent = Agent::new("build");
        h.store.create_agent(&agent).await.unwrap();

        h.engine.assign().await.unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.task_id, task.id);
        assert_eq!(report.agent_id, agent.id);
        assert!(report.outcome.is_success());
    }
}
