//! Terminates running sessions that drifted from their task or agent.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Session, SessionStatus, TaskStatus};
use crate::domain::ports::SchedulerStore;

/// Terminates `running` sessions that no longer line up with their task and
/// agent.
pub struct SessionReconciler {
    store: Arc<dyn SchedulerStore>,
    grace: Duration,
}

impl SessionReconciler {
    /// `grace_secs` should cover at least two ticks so a session created
    /// during the current tick is never judged.
    pub fn new(store: Arc<dyn SchedulerStore>, grace_secs: u64) -> Self {
        Self {
            store,
            grace: Duration::seconds(i64::try_from(grace_secs).unwrap_or(i64::MAX)),
        }
    }

    /// Reconcile as of the current time. Returns sessions terminated.
    pub async fn reconcile(&self) -> DomainResult<usize> {
        self.reconcile_at(Utc::now()).await
    }

    /// Returns the number of sessions terminated.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let mut terminated = 0;
        for session in self.store.get_running_sessions().await? {
            if now - session.started_at < self.grace {
                continue;
            }
            let Some(reason) = self.drift(&session).await? else {
                continue;
            };
            match self
                .store
                .update_session_status(session.id, SessionStatus::Terminated, Some(reason.clone()))
                .await
            {
                Ok(()) => {
                    info!(session_id = %session.id, task_id = %session.task_id, %reason, "orphaned session terminated");
                    terminated += 1;
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "failed to terminate session"),
            }
        }
        Ok(terminated)
    }

    async fn drift(&self, session: &Session) -> DomainResult<Option<String>> {
        match self.store.get_task(session.task_id).await? {
            Some(task) if task.status == TaskStatus::InProgress => {}
            Some(task) => return Ok(Some(format!("task is {}", task.status))),
            None => return Ok(Some("task no longer exists".to_string())),
        }
        match self.store.get_agent(session.agent_id).await? {
            Some(agent) if agent.owns(session.task_id, session.id) => Ok(None),
            Some(agent) => Ok(Some(format!(
                "agent is {} and no longer points at this session",
                agent.status
            ))),
            None => Ok(Some("agent no longer exists".to_string())),
        }
    }
}
