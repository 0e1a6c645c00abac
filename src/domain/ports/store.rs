//! Persistence port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Agent, AgentAssignment, AgentStatus, Session, SessionStatus, Task, TaskPatch, TaskStatus,
    WaveRun, WaveRunStatus,
};

/// Filters for querying tasks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Exact status
    pub status: Option<TaskStatus>,
    /// Owning task list
    pub task_list_id: Option<Uuid>,
    /// Wave within the task list
    pub wave_number: Option<u32>,
    /// Current assignee
    pub assigned_agent_id: Option<Uuid>,
}

impl TaskFilter {
    /// Tasks in one status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Tasks of one wave.
    pub fn wave(task_list_id: Uuid, wave_number: u32) -> Self {
        Self {
            task_list_id: Some(task_list_id),
            wave_number: Some(wave_number),
            ..Self::default()
        }
    }

    /// Whether `task` passes every set field.
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.task_list_id.map_or(true, |id| task.task_list_id == Some(id))
            && self.wave_number.map_or(true, |n| task.wave_number == Some(n))
            && self
                .assigned_agent_id
                .map_or(true, |id| task.assigned_agent_id == Some(id))
    }
}

/// Durable state shared by the tick loop and the supervisory loop.
///
/// Every method is independently atomic. Only [`SchedulerStore::claim_task`]
/// is required to be a conditional write; everything else is last-writer-wins
/// and relies on reconciliation.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Insert a new task
    async fn create_task(&self, task: &Task) -> DomainResult<()>;

    /// Get a task by ID
    async fn get_task(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// List tasks matching the filter in arrival order (oldest first)
    async fn get_tasks(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Apply a partial update. Errors with `TaskNotFound` for unknown ids.
    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> DomainResult<()>;

    /// Move a task from `pending` to `in_progress` assigned to `agent_id`.
    ///
    /// Returns `true` iff the task was `pending` at write time and is now
    /// `in_progress`. Two concurrent claims on the same task succeed for at
    /// most one caller.
    async fn claim_task(&self, task_id: Uuid, agent_id: Uuid) -> DomainResult<bool>;

    /// Insert a new agent row
    async fn create_agent(&self, agent: &Agent) -> DomainResult<()>;

    /// Get an agent by ID
    async fn get_agent(&self, id: Uuid) -> DomainResult<Option<Agent>>;

    /// All agents
    async fn get_agents(&self) -> DomainResult<Vec<Agent>>;

    /// Agents in `working` status
    async fn get_working_agents(&self) -> DomainResult<Vec<Agent>> {
        let agents = self.get_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.status == AgentStatus::Working)
            .collect())
    }

    /// Agents in `idle` status
    async fn get_idle_agents(&self) -> DomainResult<Vec<Agent>> {
        let agents = self.get_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .collect())
    }

    /// Set status and task/session pointers together.
    ///
    /// `status_changed_at` is stamped with `at`, and only when the status
    /// actually changes.
    async fn update_agent_status_at(
        &self,
        id: Uuid,
        next: AgentAssignment,
        at: DateTime<Utc>,
    ) -> DomainResult<()>;

    /// [`SchedulerStore::update_agent_status_at`] stamped with the current time
    async fn update_agent_status(&self, id: Uuid, next: AgentAssignment) -> DomainResult<()> {
        self.update_agent_status_at(id, next, Utc::now()).await
    }

    /// Refresh the heartbeat (called on behalf of the running worker)
    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<()>;

    /// Clear the heartbeat
    async fn clear_heartbeat(&self, id: Uuid) -> DomainResult<()>;

    /// Insert a new session row
    async fn create_session(&self, session: &Session) -> DomainResult<()>;

    /// Get a session by ID
    async fn get_session(&self, id: Uuid) -> DomainResult<Option<Session>>;

    /// Sessions in `running` status
    async fn get_running_sessions(&self) -> DomainResult<Vec<Session>>;

    /// Sessions started at or after `since`
    async fn get_sessions_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<Session>>;

    /// Sessions of one agent started at or after `since`, newest first
    async fn get_agent_sessions_since(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<Session>>;

    /// All sessions of one task, newest first
    async fn get_task_sessions(&self, task_id: Uuid) -> DomainResult<Vec<Session>>;

    /// Close a session with an optional reason; stamps `completed_at`
    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        reason: Option<String>,
    ) -> DomainResult<()>;

    /// Store the tail of the worker output on a session
    async fn record_session_output(&self, id: Uuid, output: &str) -> DomainResult<()>;

    /// Insert a new wave run
    async fn create_wave_run(&self, run: &WaveRun) -> DomainResult<()>;

    /// Wave runs, optionally filtered by status
    async fn get_wave_runs(&self, status: Option<WaveRunStatus>) -> DomainResult<Vec<WaveRun>>;

    /// Persist `current_wave` and `status` of a run
    async fn update_wave_run(&self, run: &WaveRun) -> DomainResult<()>;
}
