//! Heartbeat-based agent health checks.
//!
//! `working` agents that stop heartbeating are marked `stuck`; agents stuck
//! past the dead threshold are cleaned up and their task requeued.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Agent, AgentAssignment, AgentStatus, HealthConfig, SessionStatus, TaskPatch, TaskStatus,
};
use crate::domain::ports::{Notifier, SchedulerStore};
use crate::services::event_bus::{EventBus, EventPayload};

/// Counts from one health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Working agents that went silent
    pub marked_stuck: usize,
    /// Stuck agents past the dead threshold, reset to idle
    pub cleaned: usize,
    /// Stale heartbeats removed from idle agents
    pub heartbeats_cleared: usize,
}

impl HealthReport {
    /// Nothing changed.
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

/// Heartbeat checks run once per tick.
pub struct AgentHealthMonitor {
    store: Arc<dyn SchedulerStore>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    config: HealthConfig,
}

impl AgentHealthMonitor {
    /// Monitor using the `health` config section.
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            config,
        }
    }

    /// Check every agent against the current time.
    pub async fn check(&self) -> DomainResult<()> {
        self.check_at(Utc::now()).await.map(|_| ())
    }

    /// Check every agent as of `now`.
    ///
    /// A failure on one agent is logged and published as `agent-error`; the
    /// remaining agents are still checked.
    pub async fn check_at(&self, now: DateTime<Utc>) -> DomainResult<HealthReport> {
        let stuck_after = secs(self.config.stuck_threshold_secs);
        let dead_after = secs(self.config.dead_threshold_secs);
        let clear_after = secs(self.config.idle_heartbeat_clear_secs);

        let mut report = HealthReport::default();
        for agent in self.store.get_agents().await? {
            if self.config.heartbeat_exempt_types.contains(&agent.agent_type) {
                continue;
            }
            let result = match agent.status {
                AgentStatus::Working if agent.is_silent_for(stuck_after, now) => {
                    self.mark_stuck(&agent, now).await.map(|()| report.marked_stuck += 1)
                }
                AgentStatus::Stuck if now - agent.status_changed_at >= dead_after => {
                    self.clean_up_dead(&agent, now).await.map(|()| report.cleaned += 1)
                }
                AgentStatus::Idle
                    if agent
                        .last_heartbeat
                        .is_some_and(|hb| now - hb > clear_after) =>
                {
                    self.store
                        .clear_heartbeat(agent.id)
                        .await
                        .map(|()| report.heartbeats_cleared += 1)
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(agent_id = %agent.id, error = %e, "health check failed for agent");
                self.events.publish(EventPayload::AgentError {
                    agent_id: agent.id,
                    error: format!("health check failed: {e}"),
                });
            }
        }

        if !report.is_quiet() {
            info!(
                marked_stuck = report.marked_stuck,
                cleaned = report.cleaned,
                heartbeats_cleared = report.heartbeats_cleared,
                "agent health check"
            );
        }
        Ok(report)
    }

    async fn mark_stuck(&self, agent: &Agent, now: DateTime<Utc>) -> DomainResult<()> {
        agent.transition(&AgentAssignment::Stuck)?;
        self.store
            .update_agent_status_at(agent.id, AgentAssignment::Stuck, now)
            .await?;
        debug!(agent_id = %agent.id, last_seen = %agent.last_seen(), "agent marked stuck");
        Ok(())
    }

    async fn clean_up_dead(&self, agent: &Agent, now: DateTime<Utc>) -> DomainResult<()> {
        let mut requeued = None;
        if let Some(task_id) = agent.current_task_id {
            if let Some(task) = self.store.get_task(task_id).await? {
                if task.status == TaskStatus::InProgress && task.assigned_agent_id == Some(agent.id) {
                    let patch = TaskPatch::status(TaskStatus::Pending).unassigned();
                    self.store.update_task(task_id, &patch).await?;
                    requeued = Some(task_id);
                }
            }
        }
        if let Some(session_id) = agent.current_session_id {
            let open = self
                .store
                .get_session(session_id)
                .await?
                .is_some_and(|s| s.status.is_open());
            if open {
                self.store
                    .update_session_status(
                        session_id,
                        SessionStatus::Terminated,
                        Some("agent dead: no heartbeat".to_string()),
                    )
                    .await?;
            }
        }

        agent.transition(&AgentAssignment::Idle)?;
        self.store
            .update_agent_status_at(agent.id, AgentAssignment::Idle, now)
            .await?;
        self.store.clear_heartbeat(agent.id).await?;

        warn!(agent_id = %agent.id, requeued_task_id = ?requeued, "dead agent cleaned up");
        self.events.publish(EventPayload::AgentRecovered {
            agent_id: agent.id,
            requeued_task_id: requeued,
        });
        let message = format!(
            "agent {} ({}) was dead and has been reset",
            agent.id, agent.agent_type
        );
        if let Err(e) = self.notifier.notify("agents", &message).await {
            debug!(error = %e, "notification dropped");
        }
        Ok(())
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}
