//! In-memory store.
//!
//! Used by tests and `--dry-run`. Every method takes the write lock for its
//! whole body, which gives `claim_task` the same compare-and-set guarantee as
//! the conditional `UPDATE` in the SQLite adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, AgentAssignment, Session, SessionStatus, Task, TaskPatch, TaskStatus, WaveRun,
    WaveRunStatus,
};
use crate::domain::ports::{SchedulerStore, TaskFilter};

#[derive(Default)]
struct Tables {
    tasks: Vec<Task>,
    agents: Vec<Agent>,
    sessions: HashMap<Uuid, Session>,
    wave_runs: Vec<WaveRun>,
}

/// Non-durable [`SchedulerStore`] backed by plain tables behind one lock.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    sessions
}

#[async_trait]
impl SchedulerStore for InMemoryStore {
    async fn create_task(&self, task: &Task) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        if tables.tasks.iter().any(|t| t.id == task.id) {
            return Err(DomainError::InvalidValue(format!("duplicate task id {}", task.id)));
        }
        tables.tasks.push(task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let tables = self.tables.read().await;
        Ok(tables.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn get_tasks(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(DomainError::TaskNotFound(id))?;
        task.apply(patch);
        Ok(())
    }

    async fn claim_task(&self, task_id: Uuid, agent_id: Uuid) -> DomainResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(task) = tables.tasks.iter_mut().find(|t| t.id == task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.apply(&TaskPatch::status(TaskStatus::InProgress).assigned_to(Some(agent_id)));
        Ok(true)
    }

    async fn create_agent(&self, agent: &Agent) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        tables.agents.push(agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables.agents.iter().find(|a| a.id == id).cloned())
    }

    async fn get_agents(&self) -> DomainResult<Vec<Agent>> {
        Ok(self.tables.read().await.agents.clone())
    }

    async fn update_agent_status_at(
        &self,
        id: Uuid,
        next: AgentAssignment,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(DomainError::AgentNotFound(id))?;
        agent.apply(&next, at);
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(DomainError::AgentNotFound(id))?;
        agent.last_heartbeat = Some(at);
        Ok(())
    }

    async fn clear_heartbeat(&self, id: Uuid) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(DomainError::AgentNotFound(id))?;
        agent.last_heartbeat = None;
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> DomainResult<Option<Session>> {
        Ok(self.tables.read().await.sessions.get(&id).cloned())
    }

    async fn get_running_sessions(&self) -> DomainResult<Vec<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .cloned()
            .collect())
    }

    async fn get_sessions_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<Session>> {
        let tables = self.tables.read().await;
        let sessions = tables
            .sessions
            .values()
            .filter(|s| s.started_at >= since)
            .cloned()
            .collect();
        Ok(newest_first(sessions))
    }

    async fn get_agent_sessions_since(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<Session>> {
        let tables = self.tables.read().await;
        let sessions = tables
            .sessions
            .values()
            .filter(|s| s.agent_id == agent_id && s.started_at >= since)
            .cloned()
            .collect();
        Ok(newest_first(sessions))
    }

    async fn get_task_sessions(&self, task_id: Uuid) -> DomainResult<Vec<Session>> {
        let tables = self.tables.read().await;
        let sessions = tables
            .sessions
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        Ok(newest_first(sessions))
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        reason: Option<String>,
    ) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or(DomainError::SessionNotFound(id))?;
        session.status = status;
        if reason.is_some() {
            session.reason = reason;
        }
        if !status.is_open() {
            session.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_session_output(&self, id: Uuid, output: &str) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or(DomainError::SessionNotFound(id))?;
        session.output = Some(output.to_string());
        Ok(())
    }

    async fn create_wave_run(&self, run: &WaveRun) -> DomainResult<()> {
        self.tables.write().await.wave_runs.push(run.clone());
        Ok(())
    }

    async fn get_wave_runs(&self, status: Option<WaveRunStatus>) -> DomainResult<Vec<WaveRun>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wave_runs
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn update_wave_run(&self, run: &WaveRun) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .wave_runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or(DomainError::WaveRunNotFound(run.id))?;
        stored.current_wave = run.current_wave;
        stored.status = run.status;
        stored.updated_at = run.updated_at;
        Ok(())
    }
}
