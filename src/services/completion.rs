//! Applies worker outcomes and QA verdicts to scheduler state.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentAssignment, AgentStatus, SessionStatus, TaskStatus};
use crate::domain::ports::{SchedulerStore, WorkerOutcome, WorkerReport};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::retry_cooldown::RetryCooldown;

/// Applies worker reports and QA verdicts to tasks, sessions and agents.
pub struct CompletionHandler {
    store: Arc<dyn SchedulerStore>,
    cooldown: Arc<RetryCooldown>,
    events: Arc<EventBus>,
}

impl CompletionHandler {
    /// Handler sharing the assignment engine's cooldown tracker.
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        cooldown: Arc<RetryCooldown>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            cooldown,
            events,
        }
    }

    /// Apply one worker report.
    ///
    /// The session is always closed. The task only moves if it is still
    /// `in_progress` and held by the reporting agent; a report for a task
    /// that was reset or blocked in the meantime is stale.
    pub async fn handle(&self, report: WorkerReport) -> DomainResult<()> {
        let WorkerReport {
            session_id,
            task_id,
            agent_id,
            outcome,
        } = report;

        if let Some(output) = outcome.output() {
            if let Err(e) = self.store.record_session_output(session_id, output).await {
                warn!(%session_id, error = %e, "failed to store worker output");
            }
        }
        self.close_session(session_id, &outcome).await?;

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::InProgress && task.assigned_agent_id == Some(agent_id) {
            match &outcome {
                WorkerOutcome::Succeeded { .. } => {
                    let next = if task.pass_criteria.is_some() {
                        TaskStatus::PendingVerification
                    } else {
                        TaskStatus::Completed
                    };
                    let patch = task.transition(next)?;
                    self.store.update_task(task_id, &patch).await?;
                    if next == TaskStatus::Completed {
                        self.cooldown.forget(task_id).await;
                    }
                    info!(%task_id, display_id = %task.display_id, status = %next, "task finished");
                    self.events.publish(EventPayload::TaskCompleted {
                        task_id,
                        display_id: task.display_id.clone(),
                        awaiting_verification: next == TaskStatus::PendingVerification,
                    });
                }
                WorkerOutcome::Failed { error, .. } => {
                    let retry_count = task.retry_count + 1;
                    let patch = task
                        .transition(TaskStatus::Failed)?
                        .with_retry_count(retry_count)
                        .with_failure_context(error.clone());
                    self.store.update_task(task_id, &patch).await?;
                    self.cooldown.record_failure(task_id, Utc::now()).await;
                    warn!(%task_id, display_id = %task.display_id, retry_count, %error, "task failed");
                    self.events.publish(EventPayload::TaskFailed {
                        task_id,
                        display_id: task.display_id.clone(),
                        error: error.clone(),
                        retry_count,
                    });
                }
            }
        } else {
            info!(
                %task_id,
                status = %task.status,
                "stale worker report, task left as is"
            );
        }

        self.release_agent(agent_id, session_id).await
    }

    /// Apply a QA verdict to a task awaiting verification.
    pub async fn record_verification(
        &self,
        task_id: Uuid,
        passed: bool,
        notes: Option<String>,
    ) -> DomainResult<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(task_id))?;

        // Only a verification verdict may settle a task awaiting one.
        if task.status != TaskStatus::PendingVerification {
            let next = if passed {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            return Err(DomainError::transition("task", task.status, next));
        }

        if passed {
            let patch = task.transition(TaskStatus::Completed)?;
            self.store.update_task(task_id, &patch).await?;
            self.cooldown.forget(task_id).await;
            self.events.publish(EventPayload::TaskCompleted {
                task_id,
                display_id: task.display_id,
                awaiting_verification: false,
            });
            return Ok(());
        }

        let retry_count = task.retry_count + 1;
        let error = notes.unwrap_or_else(|| "verification failed".to_string());
        let patch = task
            .transition(TaskStatus::Failed)?
            .with_retry_count(retry_count)
            .with_failure_context(error.clone());
        self.store.update_task(task_id, &patch).await?;
        self.cooldown.record_failure(task_id, Utc::now()).await;
        self.events.publish(EventPayload::TaskFailed {
            task_id,
            display_id: task.display_id,
            error,
            retry_count,
        });
        Ok(())
    }

    async fn close_session(&self, session_id: Uuid, outcome: &WorkerOutcome) -> DomainResult<()> {
        let Some(session) = self.store.get_session(session_id).await? else {
            warn!(%session_id, "report for unknown session");
            return Ok(());
        };
        if !session.status.is_open() {
            debug!(%session_id, status = %session.status, "session already closed");
            return Ok(());
        }
        let (status, reason) = match outcome {
            WorkerOutcome::Succeeded { .. } => (SessionStatus::Completed, None),
            WorkerOutcome::Failed { error, .. } => (SessionStatus::Failed, Some(error.clone())),
        };
        self.store
            .update_session_status(session_id, status, reason)
            .await
    }

    async fn release_agent(&self, agent_id: Uuid, session_id: Uuid) -> DomainResult<()> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Ok(());
        };
        if agent.status != AgentStatus::Idle && agent.current_session_id == Some(session_id) {
            agent.transition(&AgentAssignment::Idle)?;
            self.store
                .update_agent_status(agent_id, AgentAssignment::Idle)
                .await?;
        }
        Ok(())
    }
}
