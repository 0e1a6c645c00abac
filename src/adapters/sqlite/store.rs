//! SQLite implementation of the SchedulerStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, parse_optional_datetime, parse_optional_uuid, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, AgentAssignment, AgentStatus, Session, SessionStatus, Task, TaskPatch, TaskPriority,
    TaskStatus, WaveRun, WaveRunStatus,
};
use crate::domain::ports::{SchedulerStore, TaskFilter};

/// [`SchedulerStore`] persisted in SQLite.
///
/// Task claims are a single conditional `UPDATE`, so concurrent claimers
/// across pool connections see at most one winner.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap a migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn sessions_where(
        &self,
        clause: &str,
        binds: &[String],
    ) -> DomainResult<Vec<Session>> {
        let query = format!("SELECT * FROM sessions WHERE {clause} ORDER BY started_at DESC");
        let mut q = sqlx::query_as::<_, SessionRow>(&query);
        for bind in binds {
            q = q.bind(bind);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Session::try_from).collect()
    }
}

#[async_trait]
impl SchedulerStore for SqliteStore {
    async fn create_task(&self, task: &Task) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO tasks (id, display_id, status, priority, category, retry_count,
               max_retries, assigned_agent_id, task_list_id, wave_number, pass_criteria,
               failure_context, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.display_id)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(&task.category)
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.assigned_agent_id.map(|id| id.to_string()))
        .bind(task.task_list_id.map(|id| id.to_string()))
        .bind(task.wave_number.map(i64::from))
        .bind(&task.pass_criteria)
        .bind(&task.failure_context)
        .bind(fmt_datetime(task.created_at))
        .bind(fmt_datetime(task.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn get_tasks(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks WHERE 1=1");
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_list_id) = filter.task_list_id {
            query.push(" AND task_list_id = ").push_bind(task_list_id.to_string());
        }
        if let Some(wave_number) = filter.wave_number {
            query.push(" AND wave_number = ").push_bind(i64::from(wave_number));
        }
        if let Some(agent_id) = filter.assigned_agent_id {
            query.push(" AND assigned_agent_id = ").push_bind(agent_id.to_string());
        }
        query.push(" ORDER BY created_at ASC, rowid ASC");

        let rows = query.build_query_as::<TaskRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> DomainResult<()> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE tasks SET updated_at = ");
        query.push_bind(fmt_datetime(Utc::now()));
        if let Some(status) = patch.status {
            query.push(", status = ").push_bind(status.as_str());
        }
        if let Some(agent) = patch.assigned_agent_id {
            query
                .push(", assigned_agent_id = ")
                .push_bind(agent.map(|id| id.to_string()));
        }
        if let Some(retry_count) = patch.retry_count {
            query.push(", retry_count = ").push_bind(i64::from(retry_count));
        }
        if let Some(context) = &patch.failure_context {
            query.push(", failure_context = ").push_bind(context.clone());
        }
        query.push(" WHERE id = ").push_bind(id.to_string());

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn claim_task(&self, task_id: Uuid, agent_id: Uuid) -> DomainResult<bool> {
        // The status guard in the WHERE clause is the whole claim protocol:
        // SQLite serializes writers, so only one UPDATE can see 'pending'.
        let result = sqlx::query(
            r#"UPDATE tasks SET status = 'in_progress', assigned_agent_id = ?, updated_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(agent_id.to_string())
        .bind(fmt_datetime(Utc::now()))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_agent(&self, agent: &Agent) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO agents (id, agent_type, status, current_task_id, current_session_id,
               last_heartbeat, status_changed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(agent.id.to_string())
        .bind(&agent.agent_type)
        .bind(agent.status.as_str())
        .bind(agent.current_task_id.map(|id| id.to_string()))
        .bind(agent.current_session_id.map(|id| id.to_string()))
        .bind(agent.last_heartbeat.map(fmt_datetime))
        .bind(fmt_datetime(agent.status_changed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Agent::try_from).transpose()
    }

    async fn get_agents(&self) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn get_working_agents(&self) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as("SELECT * FROM agents WHERE status = 'working' ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn get_idle_agents(&self) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as("SELECT * FROM agents WHERE status = 'idle' ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn update_agent_status_at(
        &self,
        id: Uuid,
        next: AgentAssignment,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let status = next.status().as_str();
        let now = fmt_datetime(at);

        let mut query =
            QueryBuilder::<Sqlite>::new("UPDATE agents SET status_changed_at = CASE WHEN status = ");
        query
            .push_bind(status)
            .push(" THEN status_changed_at ELSE ")
            .push_bind(now)
            .push(" END, status = ")
            .push_bind(status);
        match next {
            AgentAssignment::Idle => {
                query.push(", current_task_id = NULL, current_session_id = NULL");
            }
            AgentAssignment::Working {
                task_id,
                session_id,
            } => {
                query
                    .push(", current_task_id = ")
                    .push_bind(task_id.to_string())
                    .push(", current_session_id = ")
                    .push_bind(session_id.to_string());
            }
            AgentAssignment::Stuck => {}
        }
        query.push(" WHERE id = ").push_bind(id.to_string());

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id));
        }
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        let result = sqlx::query("UPDATE agents SET last_heartbeat = ? WHERE id = ?")
            .bind(fmt_datetime(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id));
        }
        Ok(())
    }

    async fn clear_heartbeat(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("UPDATE agents SET last_heartbeat = NULL WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id));
        }
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO sessions (id, agent_id, task_id, status, reason, output, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session.id.to_string())
        .bind(session.agent_id.to_string())
        .bind(session.task_id.to_string())
        .bind(session.status.as_str())
        .bind(&session.reason)
        .bind(&session.output)
        .bind(fmt_datetime(session.started_at))
        .bind(session.completed_at.map(fmt_datetime))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> DomainResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Session::try_from).transpose()
    }

    async fn get_running_sessions(&self) -> DomainResult<Vec<Session>> {
        self.sessions_where("status = 'running'", &[]).await
    }

    async fn get_sessions_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<Session>> {
        self.sessions_where("started_at >= ?", &[fmt_datetime(since)]).await
    }

    async fn get_agent_sessions_since(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<Session>> {
        self.sessions_where(
            "agent_id = ? AND started_at >= ?",
            &[agent_id.to_string(), fmt_datetime(since)],
        )
        .await
    }

    async fn get_task_sessions(&self, task_id: Uuid) -> DomainResult<Vec<Session>> {
        self.sessions_where("task_id = ?", &[task_id.to_string()]).await
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        reason: Option<String>,
    ) -> DomainResult<()> {
        let completed_at = (!status.is_open()).then(|| fmt_datetime(Utc::now()));
        let result = sqlx::query(
            r#"UPDATE sessions SET status = ?, reason = COALESCE(?, reason),
               completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::SessionNotFound(id));
        }
        Ok(())
    }

    async fn record_session_output(&self, id: Uuid, output: &str) -> DomainResult<()> {
        let result = sqlx::query("UPDATE sessions SET output = ? WHERE id = ?")
            .bind(output)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::SessionNotFound(id));
        }
        Ok(())
    }

    async fn create_wave_run(&self, run: &WaveRun) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO wave_runs (id, task_list_id, current_wave, total_waves, status, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.task_list_id.to_string())
        .bind(i64::from(run.current_wave))
        .bind(i64::from(run.total_waves))
        .bind(run.status.as_str())
        .bind(fmt_datetime(run.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_wave_runs(&self, status: Option<WaveRunStatus>) -> DomainResult<Vec<WaveRun>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM wave_runs");
        if let Some(status) = status {
            query.push(" WHERE status = ").push_bind(status.as_str());
        }
        query.push(" ORDER BY rowid");
        let rows = query.build_query_as::<WaveRunRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(WaveRun::try_from).collect()
    }

    async fn update_wave_run(&self, run: &WaveRun) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE wave_runs SET current_wave = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(i64::from(run.current_wave))
        .bind(run.status.as_str())
        .bind(fmt_datetime(run.updated_at))
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::WaveRunNotFound(run.id));
        }
        Ok(())
    }
}

fn to_u32(value: i64, field: &str) -> DomainResult<u32> {
    u32::try_from(value)
        .map_err(|_| DomainError::SerializationError(format!("{field} out of range: {value}")))
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    display_id: String,
    status: String,
    priority: String,
    category: String,
    retry_count: i64,
    max_retries: i64,
    assigned_agent_id: Option<String>,
    task_list_id: Option<String>,
    wave_number: Option<i64>,
    pass_criteria: Option<String>,
    failure_context: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let priority = TaskPriority::from_str(&row.priority).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid priority: {}", row.priority))
        })?;

        Ok(Task {
            id: parse_uuid(&row.id)?,
            display_id: row.display_id,
            status,
            priority,
            category: row.category,
            retry_count: to_u32(row.retry_count, "retry_count")?,
            max_retries: to_u32(row.max_retries, "max_retries")?,
            assigned_agent_id: parse_optional_uuid(row.assigned_agent_id)?,
            task_list_id: parse_optional_uuid(row.task_list_id)?,
            wave_number: row
                .wave_number
                .map(|n| to_u32(n, "wave_number"))
                .transpose()?,
            pass_criteria: row.pass_criteria,
            failure_context: row.failure_context,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    agent_type: String,
    status: String,
    current_task_id: Option<String>,
    current_session_id: Option<String>,
    last_heartbeat: Option<String>,
    status_changed_at: String,
}

impl TryFrom<AgentRow> for Agent {
    type Error = DomainError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(Agent {
            id: parse_uuid(&row.id)?,
            agent_type: row.agent_type,
            status: row.status.parse::<AgentStatus>()?,
            current_task_id: parse_optional_uuid(row.current_task_id)?,
            current_session_id: parse_optional_uuid(row.current_session_id)?,
            last_heartbeat: parse_optional_datetime(row.last_heartbeat)?,
            status_changed_at: parse_datetime(&row.status_changed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    agent_id: String,
    task_id: String,
    status: String,
    reason: Option<String>,
    output: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = DomainError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid session status: {}", row.status))
        })?;
        Ok(Session {
            id: parse_uuid(&row.id)?,
            agent_id: parse_uuid(&row.agent_id)?,
            task_id: parse_uuid(&row.task_id)?,
            status,
            reason: row.reason,
            output: row.output,
            started_at: parse_datetime(&row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WaveRunRow {
    id: String,
    task_list_id: String,
    current_wave: i64,
    total_waves: i64,
    status: String,
    updated_at: String,
}

impl TryFrom<WaveRunRow> for WaveRun {
    type Error = DomainError;

    fn try_from(row: WaveRunRow) -> Result<Self, Self::Error> {
        let status = WaveRunStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid wave run status: {}", row.status))
        })?;
        Ok(WaveRun {
            id: parse_uuid(&row.id)?,
            task_list_id: parse_uuid(&row.task_list_id)?,
            current_wave: to_u32(row.current_wave, "current_wave")?,
            total_waves: to_u32(row.total_waves, "total_waves")?,
            status,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}
