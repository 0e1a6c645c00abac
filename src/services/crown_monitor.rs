//! Supervisory loop.
//!
//! Runs on its own slower interval, independent of the tick loop, and looks
//! for patterns a single tick cannot see: agents that keep failing, tasks
//! that burned through their retries, tasks nobody holds, and tasks bouncing
//! between agents. When it had to step in, it may ask a diagnostic worker to
//! investigate the worst blocked task.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Agent, AgentAssignment, AgentStatus, Config, CrownConfig, Session, SessionStatus, Task,
    TaskPatch, TaskStatus,
};
use crate::domain::ports::{
    Notifier, SchedulerStore, SpawnRequest, TaskFilter, WorkerDispatcher, WorkerOutcome,
};
use crate::services::crash_protect::crash_protect;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::retry_cooldown::RetryCooldown;

const ALERT_CHANNEL: &str = "crown";
const DIAGNOSIS_SESSIONS: usize = 3;
const DIAGNOSIS_OUTPUT_BYTES: usize = 2000;

/// Per-agent failure statistics over the trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgentStats {
    /// Agent the stats belong to
    pub agent_id: Uuid,
    /// Sessions started in the window
    pub sessions: usize,
    /// Failed or terminated sessions
    pub failures: usize,
    /// `failures / sessions`, 0 with no sessions
    pub failure_rate: f64,
    /// Failed sessions in a row, newest first, ignoring ones still running
    pub consecutive_failures: u32,
    /// Task of the most recent failed session
    pub last_failed_task: Option<Uuid>,
    /// Newest session in the window is still running
    pub newest_open: bool,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrownReport {
    /// Schedulable agents examined
    pub agents_checked: usize,
    /// Silent working agents reset
    pub stuck_resets: usize,
    /// Agents reset for a failure streak
    pub failing_agent_resets: usize,
    /// Tasks blocked after running out of retries
    pub exhausted_blocked: usize,
    /// `in_progress` tasks nobody held, returned to pending
    pub orphans_reset: usize,
    /// Tasks blocked for reassignment loops
    pub loops_blocked: usize,
    /// Notifications sent
    pub alerts: usize,
    /// Task a diagnostic worker was dispatched for
    pub diagnosed_task: Option<Uuid>,
}

impl CrownReport {
    /// Every reset and block this pass made.
    pub fn interventions(&self) -> usize {
        self.stuck_resets
            + self.failing_agent_resets
            + self.exhausted_blocked
            + self.orphans_reset
            + self.loops_blocked
    }
}

/// Supervisory pass over agents and tasks.
///
/// Independent of the tick loop. It only moves agents toward `idle` and tasks
/// toward `pending` or `blocked`, so it can interleave with a tick.
pub struct CrownMonitor {
    store: Arc<dyn SchedulerStore>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    cooldown: Arc<RetryCooldown>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    config: CrownConfig,
    stuck_threshold: Duration,
    schedulable_types: Vec<String>,
    alerted: Mutex<HashSet<Uuid>>,
    diagnosed: Mutex<HashSet<Uuid>>,
}

impl CrownMonitor {
    /// Monitor using the `crown`, `health` and `scheduler` config sections.
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        cooldown: Arc<RetryCooldown>,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            dispatcher,
            cooldown,
            events,
            notifier,
            config: config.crown.clone(),
            stuck_threshold: secs(config.health.stuck_threshold_secs),
            schedulable_types: config.scheduler.assignable_agent_types.clone(),
            alerted: Mutex::new(HashSet::new()),
            diagnosed: Mutex::new(HashSet::new()),
        }
    }

    /// One pass as of the current time.
    pub async fn pass(&self) -> DomainResult<CrownReport> {
        self.pass_at(Utc::now()).await
    }

    /// One pass as of `now`.
    ///
    /// Order: per-agent checks, exhaustion blocking, orphan reset, loop
    /// detection, then diagnosis when anything was done.
    pub async fn pass_at(&self, now: DateTime<Utc>) -> DomainResult<CrownReport> {
        let mut report = CrownReport::default();

        for agent in self.store.get_agents().await? {
            if !self.schedulable_types.contains(&agent.agent_type) {
                continue;
            }
            report.agents_checked += 1;
            if let Err(e) = self.check_agent(&agent, now, &mut report).await {
                warn!(agent_id = %agent.id, error = %e, "crown check failed for agent");
            }
        }

        self.block_exhausted(&mut report).await?;
        self.reset_orphans(now, &mut report).await?;
        self.detect_loops(now, &mut report).await?;

        if self.config.diagnosis_enabled && (report.interventions() > 0 || report.alerts > 0) {
            report.diagnosed_task = self.diagnose_worst_blocked().await?;
        }

        if report.interventions() > 0 || report.alerts > 0 {
            info!(
                stuck_resets = report.stuck_resets,
                failing_agent_resets = report.failing_agent_resets,
                exhausted_blocked = report.exhausted_blocked,
                orphans_reset = report.orphans_reset,
                loops_blocked = report.loops_blocked,
                alerts = report.alerts,
                "crown pass intervened"
            );
        } else {
            debug!(agents_checked = report.agents_checked, "crown pass quiet");
        }
        Ok(report)
    }

    /// Failure statistics for one agent over the configured window.
    pub async fn agent_stats(&self, agent_id: Uuid, now: DateTime<Utc>) -> DomainResult<AgentStats> {
        let since = now - secs(self.config.failure_window_secs);
        let sessions = self.store.get_agent_sessions_since(agent_id, since).await?;
        Ok(stats_for(agent_id, &sessions))
    }

    async fn check_agent(
        &self,
        agent: &Agent,
        now: DateTime<Utc>,
        report: &mut CrownReport,
    ) -> DomainResult<()> {
        let stats = self.agent_stats(agent.id, now).await?;
        debug!(
            agent_id = %agent.id,
            sessions = stats.sessions,
            failure_rate = stats.failure_rate,
            consecutive_failures = stats.consecutive_failures,
            "agent stats"
        );

        if agent.status == AgentStatus::Working && self.is_stuck(agent, now).await? {
            self.reset_stuck(agent, now).await?;
            report.stuck_resets += 1;
            return Ok(());
        }

        if stats.consecutive_failures >= self.config.consecutive_failure_threshold {
            // A running newest session means the streak predates the current work.
            if agent.status != AgentStatus::Idle && !stats.newest_open {
                let context = format!(
                    "agent reset after {} consecutive failures",
                    stats.consecutive_failures
                );
                self.requeue_held_task(agent, &context, now).await?;
                self.reset_agent(agent, "repeated failures", now).await?;

                warn!(
                    agent_id = %agent.id,
                    consecutive_failures = stats.consecutive_failures,
                    "failing agent reset"
                );
                self.events.publish(EventPayload::AgentError {
                    agent_id: agent.id,
                    error: context,
                });
                report.failing_agent_resets += 1;
            }
            if let Some(task_id) = stats.last_failed_task {
                if let Some(task) = self.store.get_task(task_id).await? {
                    if task.retries_exhausted() && task.status.can_transition_to(TaskStatus::Blocked) {
                        self.block_for_exhaustion(&task, report).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Silent past the stuck threshold with no session started recently.
    async fn is_stuck(&self, agent: &Agent, now: DateTime<Utc>) -> DomainResult<bool> {
        if !agent.is_silent_for(self.stuck_threshold, now) {
            return Ok(false);
        }
        let recent = self
            .store
            .get_agent_sessions_since(agent.id, now - secs(self.config.recent_session_grace_secs))
            .await?;
        Ok(recent.is_empty())
    }

    async fn reset_stuck(&self, agent: &Agent, now: DateTime<Utc>) -> DomainResult<()> {
        let silent_secs = (now - agent.last_seen()).num_seconds();
        let context = format!("agent stuck: no heartbeat for {silent_secs}s");
        let task_id = self.requeue_held_task(agent, &context, now).await?;
        self.reset_agent(agent, "stuck reset by crown", now).await?;

        warn!(agent_id = %agent.id, task_id = ?task_id, "stuck agent reset");
        self.events.publish(EventPayload::AgentStuckReset {
            agent_id: agent.id,
            task_id,
        });
        Ok(())
    }

    /// Put the agent's `in_progress` task back to `pending`, counting the
    /// attempt. Returns the task id if one was requeued.
    async fn requeue_held_task(
        &self,
        agent: &Agent,
        context: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<Uuid>> {
        let Some(task_id) = agent.current_task_id else {
            return Ok(None);
        };
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::InProgress || task.assigned_agent_id != Some(agent.id) {
            return Ok(None);
        }
        let patch = task
            .transition(TaskStatus::Pending)?
            .unassigned()
            .with_retry_count(task.retry_count + 1)
            .with_failure_context(context);
        self.store.update_task(task_id, &patch).await?;
        self.cooldown.record_failure(task_id, now).await;
        Ok(Some(task_id))
    }

    /// Close the agent's open session and return it to idle.
    async fn reset_agent(&self, agent: &Agent, reason: &str, now: DateTime<Utc>) -> DomainResult<()> {
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
                        Some(reason.to_string()),
                    )
                    .await?;
            }
        }
        agent.transition(&AgentAssignment::Idle)?;
        self.store
            .update_agent_status_at(agent.id, AgentAssignment::Idle, now)
            .await
    }

    async fn block_exhausted(&self, report: &mut CrownReport) -> DomainResult<()> {
        for task in self.store.get_tasks(TaskFilter::status(TaskStatus::Failed)).await? {
            if !task.retries_exhausted() {
                continue;
            }
            if let Err(e) = self.block_for_exhaustion(&task, report).await {
                warn!(task_id = %task.id, error = %e, "failed to block exhausted task");
            }
        }
        Ok(())
    }

    async fn block_for_exhaustion(&self, task: &Task, report: &mut CrownReport) -> DomainResult<()> {
        let patch = task.transition(TaskStatus::Blocked)?;
        self.store.update_task(task.id, &patch).await?;
        self.cooldown.forget(task.id).await;
        report.exhausted_blocked += 1;

        warn!(task_id = %task.id, display_id = %task.display_id, retry_count = task.retry_count, "retries exhausted, task blocked");
        self.events.publish(EventPayload::RetryExhausted {
            task_id: task.id,
            display_id: task.display_id.clone(),
            retry_count: task.retry_count,
        });
        let message = format!(
            "{} blocked after {} failed attempts",
            task.display_id, task.retry_count
        );
        if self.alert_once(task.id, &message).await {
            report.alerts += 1;
        }
        Ok(())
    }

    /// `in_progress` tasks no agent points at, past the grace period.
    async fn reset_orphans(&self, now: DateTime<Utc>, report: &mut CrownReport) -> DomainResult<()> {
        let held: HashSet<Uuid> = self
            .store
            .get_agents()
            .await?
            .into_iter()
            .filter_map(|a| a.current_task_id)
            .collect();
        let grace = secs(self.config.orphan_grace_secs);

        for task in self.store.get_tasks(TaskFilter::status(TaskStatus::InProgress)).await? {
            if held.contains(&task.id) || now - task.updated_at < grace {
                continue;
            }
            let patch = task.transition(TaskStatus::Pending)?.unassigned();
            match self.store.update_task(task.id, &patch).await {
                Ok(()) => {
                    info!(task_id = %task.id, display_id = %task.display_id, "orphaned task reset");
                    report.orphans_reset += 1;
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to reset orphan"),
            }
        }
        Ok(())
    }

    /// Block tasks that started too many sessions inside the loop window.
    async fn detect_loops(&self, now: DateTime<Utc>, report: &mut CrownReport) -> DomainResult<()> {
        let window = self.config.loop_window_secs;
        let sessions = self.store.get_sessions_since(now - secs(window)).await?;

        let mut per_task: HashMap<Uuid, usize> = HashMap::new();
        for session in &sessions {
            *per_task.entry(session.task_id).or_default() += 1;
        }

        for (task_id, count) in per_task {
            if count < self.config.loop_session_threshold {
                continue;
            }
            let Some(task) = self.store.get_task(task_id).await? else {
                continue;
            };
            if !task.status.can_transition_to(TaskStatus::Blocked) {
                continue;
            }
            let reason = format!(
                "reassignment loop: {count} sessions in {} minutes",
                window / 60
            );
            let patch = task
                .transition(TaskStatus::Blocked)?
                .unassigned()
                .with_failure_context(reason.clone());
            self.store.update_task(task_id, &patch).await?;
            self.cooldown.forget(task_id).await;
            if task.status == TaskStatus::InProgress {
                self.release_loop_holder(&task, now).await?;
            }
            report.loops_blocked += 1;

            warn!(%task_id, display_id = %task.display_id, sessions = count, "reassignment loop, task blocked");
            self.events.publish(EventPayload::TaskBlocked {
                task_id,
                display_id: task.display_id.clone(),
                reason: reason.clone(),
            });
            if self
                .alert_once(task_id, &format!("{} {reason}", task.display_id))
                .await
            {
                report.alerts += 1;
            }
        }
        Ok(())
    }

    /// Free the agent still working a task that loop detection just blocked.
    async fn release_loop_holder(&self, task: &Task, now: DateTime<Utc>) -> DomainResult<()> {
        let Some(agent_id) = task.assigned_agent_id else {
            return Ok(());
        };
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Ok(());
        };
        if agent.status == AgentStatus::Idle || agent.current_task_id != Some(task.id) {
            return Ok(());
        }
        self.reset_agent(&agent, "task blocked: reassignment loop", now)
            .await
    }

    /// Notify at most once per task for the lifetime of this monitor.
    async fn alert_once(&self, task_id: Uuid, message: &str) -> bool {
        if !self.alerted.lock().await.insert(task_id) {
            return false;
        }
        if let Err(e) = self.notifier.notify(ALERT_CHANNEL, message).await {
            debug!(error = %e, "notification dropped");
        }
        true
    }

    /// Dispatch a diagnostic worker for the most-retried blocked task not yet
    /// diagnosed and fold its findings into the task's failure context.
    async fn diagnose_worst_blocked(&self) -> DomainResult<Option<Uuid>> {
        let blocked = self.store.get_tasks(TaskFilter::status(TaskStatus::Blocked)).await?;
        let target = {
            let diagnosed = self.diagnosed.lock().await;
            blocked
                .into_iter()
                .filter(|t| !diagnosed.contains(&t.id))
                .max_by_key(|t| t.retry_count)
        };
        let Some(task) = target else {
            return Ok(None);
        };
        self.diagnosed.lock().await.insert(task.id);

        let sessions = self.store.get_task_sessions(task.id).await?;
        let request = SpawnRequest::Diagnostic {
            prompt: diagnosis_prompt(&task, &sessions),
            model: self.config.diagnosis_model.clone(),
            timeout_secs: self.config.diagnosis_timeout_secs,
            label: format!("diagnose-{}", task.display_id),
        };
        let handle = match self.dispatcher.spawn(request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "diagnostic dispatch failed");
                return Ok(None);
            }
        };

        info!(task_id = %task.id, session_id = %handle.session_id, "diagnosis dispatched");
        self.events.publish(EventPayload::DiagnosisDispatched {
            task_id: task.id,
            display_id: task.display_id.clone(),
            session_id: handle.session_id,
        });

        let wait = std::time::Duration::from_secs(self.config.diagnosis_timeout_secs);
        match tokio::time::timeout(wait, handle.completion).await {
            Ok(Ok(WorkerOutcome::Succeeded { output: Some(findings) })) => {
                let context = match &task.failure_context {
                    Some(existing) => format!("{existing}\n\ndiagnosis:\n{findings}"),
                    None => format!("diagnosis:\n{findings}"),
                };
                let patch = TaskPatch {
                    failure_context: Some(Some(context)),
                    ..TaskPatch::default()
                };
                self.store.update_task(task.id, &patch).await?;
            }
            Ok(Ok(WorkerOutcome::Succeeded { output: None })) => {
                debug!(task_id = %task.id, "diagnosis finished without findings");
            }
            Ok(Ok(WorkerOutcome::Failed { error, .. })) => {
                warn!(task_id = %task.id, %error, "diagnostic worker failed");
            }
            Ok(Err(_)) => warn!(task_id = %task.id, "diagnostic worker vanished"),
            Err(_) => warn!(task_id = %task.id, "diagnosis timed out"),
        }
        Ok(Some(task.id))
    }

    /// Run passes on the configured interval until shutdown is signalled.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> DomainResult<()> {
        let period = std::time::Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.config.interval_secs, "crown loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    crash_protect("crown", self.pass()).await;
                }
                _ = shutdown.recv() => {
                    info!("crown loop received shutdown signal");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn stats_for(agent_id: Uuid, sessions: &[Session]) -> AgentStats {
    let is_failure = |s: &Session| {
        matches!(s.status, SessionStatus::Failed | SessionStatus::Terminated)
    };
    let failures = sessions.iter().filter(|s| is_failure(s)).count();
    let consecutive = sessions
        .iter()
        .filter(|s| !s.status.is_open())
        .take_while(|s| is_failure(s))
        .count();
    AgentStats {
        agent_id,
        sessions: sessions.len(),
        failures,
        failure_rate: if sessions.is_empty() {
            0.0
        } else {
            failures as f64 / sessions.len() as f64
        },
        consecutive_failures: u32::try_from(consecutive).unwrap_or(u32::MAX),
        last_failed_task: sessions.iter().find(|s| is_failure(s)).map(|s| s.task_id),
        newest_open: sessions.first().is_some_and(|s| s.status.is_open()),
    }
}

fn diagnosis_prompt(task: &Task, sessions: &[Session]) -> String {
    let mut prompt = format!(
        "Investigate blocked task {} ({}).\n\
         Category: {}\n\
         Attempts: {} of {}\n\
         Failure context: {}\n\n\
         Recent sessions:\n",
        task.display_id,
        task.id,
        task.category,
        task.retry_count,
        task.max_retries,
        task.failure_context.as_deref().unwrap_or("none recorded"),
    );
    for session in sessions.iter().take(DIAGNOSIS_SESSIONS) {
        prompt.push_str(&format!(
            "- {} {} {}\n",
            session.started_at.to_rfc3339(),
            session.status,
            session.reason.as_deref().unwrap_or("")
        ));
        if let Some(output) = &session.output {
            prompt.push_str(crate::adapters::dispatch::tail(output, DIAGNOSIS_OUTPUT_BYTES));
            prompt.push('\n');
        }
    }
    prompt.push_str(
        "\nIdentify the root cause, say whether the task can be retried as written, \
         and describe the smallest change that would let it succeed.\n",
    );
    prompt
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::ports::NullNotifier;
    use crate::services::test_support::{Script, ScriptedDispatcher};

    fn monitor(store: Arc<InMemoryStore>, dispatcher: Arc<ScriptedDispatcher>) -> CrownMonitor {
        CrownMonitor::new(
            store,
            dispatcher,
            Arc::new(RetryCooldown::default()),
            Arc::new(EventBus::default()),
            Arc::new(NullNotifier),
            &Config::default(),
        )
    }

    fn quiet_monitor(store: Arc<InMemoryStore>) -> CrownMonitor {
        let mut config = Config::default();
        config.crown.diagnosis_enabled = false;
        CrownMonitor::new(
            store,
            Arc::new(ScriptedDispatcher::new()),
            Arc::new(RetryCooldown::default()),
            Arc::new(EventBus::default()),
            Arc::new(NullNotifier),
            &config,
        )
    }

    /// Claim `task` for `agent` and start a session `minutes_ago`, heartbeat at `now`.
    async fn start_work(
        store: &InMemoryStore,
        agent: &Agent,
        task: &Task,
        minutes_ago: i64,
        now: DateTime<Utc>,
    ) -> Uuid {
        assert!(store.claim_task(task.id, agent.id).await.unwrap());
        let session_id = Uuid::new_v4();
        store
            .create_session(&Session::start(
                session_id,
                agent.id,
                task.id,
                now - Duration::minutes(minutes_ago),
            ))
            .await
            .unwrap();
        store
            .update_agent_status(agent.id, AgentAssignment::Working { task_id: task.id, session_id })
            .await
            .unwrap();
        store.record_heartbeat(agent.id, now).await.unwrap();
        session_id
    }

    fn closed(agent_id: Uuid, task_id: Uuid, status: SessionStatus, minutes_ago: i64) -> Session {
        let mut session = Session::start(
            Uuid::new_v4(),
            agent_id,
            task_id,
            Utc::now() - Duration::minutes(minutes_ago),
        );
        session.status = status;
        session
    }

    #[test]
    fn test_stats_count_consecutive_failures_newest_first() {
        let (agent, task) = (Uuid::new_v4(), Uuid::new_v4());
        let sessions = vec![
            closed(agent, task, SessionStatus::Running, 1),
            closed(agent, task, SessionStatus::Failed, 5),
            closed(agent, task, SessionStatus::Terminated, 10),
            closed(agent, task, SessionStatus::Completed, 15),
            closed(agent, task, SessionStatus::Failed, 20),
        ];
        let stats = stats_for(agent, &sessions);
        assert_eq!(stats.sessions, 5);
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.consecutive_failures, 2);
        assert_eq!(stats.last_failed_task, Some(task));
        assert!(stats.newest_open);
        assert!((stats.failure_rate - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_orphan_reset_honours_grace() {
        let store = Arc::new(InMemoryStore::new());
        let task = Task::new("TASK-1", "feature");
        store.create_task(&task).await.unwrap();
        store.claim_task(task.id, Uuid::new_v4()).await.unwrap();
        let monitor = monitor(store.clone(), Arc::new(ScriptedDispatcher::new()));

        let report = monitor.pass_at(Utc::now()).await.unwrap();
        assert_eq!(report.orphans_reset, 0);

        let report = monitor
            .pass_at(Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(report.orphans_reset, 1);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_agent_id, None);
    }

    #[tokio::test]
    async fn test_stuck_working_agent_is_reset_with_retry() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let agent = Agent::new("build");
        store.create_agent(&agent).await.unwrap();
        let task = Task::new("TASK-1", "feature");
        store.create_task(&task).await.unwrap();
        store.claim_task(task.id, agent.id).await.unwrap();
        let session_id = Uuid::new_v4();
        store
            .create_session(&Session::start(session_id, agent.id, task.id, now - Duration::minutes(30)))
            .await
            .unwrap();
        store
            .update_agent_status(agent.id, AgentAssignment::Working { task_id: task.id, session_id })
            .await
            .unwrap();
        store
            .record_heartbeat(agent.id, now - Duration::minutes(20))
            .await
            .unwrap();

        let report = monitor(store.clone(), Arc::new(ScriptedDispatcher::new()))
            .pass_at(now)
            .await
            .unwrap();
        assert_eq!(report.stuck_resets, 1);

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.failure_context.unwrap().starts_with("agent stuck"));
        let agent = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_recent_session_grants_grace() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let agent = Agent::new("build");
        store.create_agent(&agent).await.unwrap();
        let task = Task::new("TASK-1", "feature");
        store.create_task(&task).await.unwrap();
        store.claim_task(task.id, agent.id).await.unwrap();
        let session_id = Uuid::new_v4();
        store
            .create_session(&Session::start(session_id, agent.id, task.id, now - Duration::minutes(1)))
            .await
            .unwrap();
        store
            .update_agent_status(agent.id, AgentAssignment::Working { task_id: task.id, session_id })
            .await
            .unwrap();
        store
            .record_heartbeat(agent.id, now - Duration::minutes(20))
            .await
            .unwrap();

        let report = monitor(store.clone(), Arc::new(ScriptedDispatcher::new()))
            .pass_at(now)
            .await
            .unwrap();
        assert_eq!(report.stuck_resets, 0);
    }

    #[tokio::test]
    async fn test_diagnosis_enriches_blocked_task_once() {
        let store = Arc::new(InMemoryStore::new());
        let task = Task::new("TASK-7", "feature");
        store.create_task(&task).await.unwrap();
        store
            .update_task(
                task.id,
                &TaskPatch::status(TaskStatus::Failed)
                    .with_retry_count(3)
                    .with_failure_context("tests fail"),
            )
            .await
            .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::with_scripts([Script::Succeed(Some(
            "fixture file missing".into(),
        ))]));
        let monitor = monitor(store.clone(), dispatcher.clone());

        let report = monitor.pass_at(Utc::now()).await.unwrap();
        assert_eq!(report.exhausted_blocked, 1);
        assert_eq!(report.diagnosed_task, Some(task.id));

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Blocked);
        let context = stored.failure_context.unwrap();
        assert!(context.starts_with("tests fail"));
        assert!(context.contains("fixture file missing"));

        let requests = dispatcher.requests();
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            SpawnRequest::Diagnostic { prompt, label, .. } => {
                assert!(prompt.contains("TASK-7"));
                assert_eq!(label, "diagnose-TASK-7");
            }
            other => panic!("unexpected request {other:?}"),
        }

        // Nothing new to act on and the task was already diagnosed.
        let report = monitor.pass_at(Utc::now()).await.unwrap();
        assert_eq!(report.diagnosed_task, None);
        assert_eq!(dispatcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_streak_before_current_session_leaves_agent_working() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let agent = Agent::new("build");
        store.create_agent(&agent).await.unwrap();
        let earlier = Uuid::new_v4();
        for minutes in [20, 30, 40] {
            store
                .create_session(&closed(agent.id, earlier, SessionStatus::Failed, minutes))
                .await
                .unwrap();
        }
        let task = Task::new("TASK-20", "feature");
        store.create_task(&task).await.unwrap();
        let session_id = start_work(&store, &agent, &task, 1, now).await;

        let report = quiet_monitor(store.clone()).pass_at(now).await.unwrap();
        assert_eq!(report.failing_agent_resets, 0);

        let agent = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent_id, Some(agent.id));
        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_failing_agent_reset_requeues_held_task() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let agent = Agent::new("build");
        store.create_agent(&agent).await.unwrap();
        for minutes in [20, 30] {
            store
                .create_session(&closed(agent.id, Uuid::new_v4(), SessionStatus::Failed, minutes))
                .await
                .unwrap();
        }
        let task = Task::new("TASK-21", "feature");
        store.create_task(&task).await.unwrap();
        let session_id = start_work(&store, &agent, &task, 5, now).await;
        // The worker died but its report never arrived.
        store
            .update_session_status(session_id, SessionStatus::Failed, Some("exit 1".into()))
            .await
            .unwrap();

        let monitor = quiet_monitor(store.clone());
        let mut events = monitor.events.subscribe();
        let report = monitor.pass_at(now).await.unwrap();
        assert_eq!(report.failing_agent_resets, 1);
        assert_eq!(report.stuck_resets, 0);

        let agent = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task_id.is_none());
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_agent_id, None);
        assert_eq!(task.retry_count, 1);
        assert_eq!(
            task.failure_context.as_deref(),
            Some("agent reset after 3 consecutive failures")
        );

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.payload.kind());
        }
        assert!(kinds.contains(&"agent-error"), "events: {kinds:?}");
    }

    #[tokio::test]
    async fn test_failure_streak_blocks_exhausted_task() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let agent = Agent::new("build");
        store.create_agent(&agent).await.unwrap();
        let mut task = Task::new("TASK-22", "feature");
        task.retry_count = 3;
        store.create_task(&task).await.unwrap();
        for minutes in [20, 30, 40] {
            store
                .create_session(&closed(agent.id, task.id, SessionStatus::Failed, minutes))
                .await
                .unwrap();
        }

        let report = quiet_monitor(store.clone()).pass_at(now).await.unwrap();
        assert_eq!(report.failing_agent_resets, 0, "idle agents need no reset");
        assert_eq!(report.exhausted_blocked, 1);

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_loop_block_frees_working_agent() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let agent = Agent::new("build");
        store.create_agent(&agent).await.unwrap();
        let task = Task::new("TASK-23", "feature");
        store.create_task(&task).await.unwrap();
        for minutes in [3, 6] {
            store
                .create_session(&closed(Uuid::new_v4(), task.id, SessionStatus::Failed, minutes))
                .await
                .unwrap();
        }
        let session_id = start_work(&store, &agent, &task, 1, now).await;

        let monitor = quiet_monitor(store.clone());
        monitor.cooldown.record_failure(task.id, now).await;
        let report = monitor.pass_at(now).await.unwrap();
        assert_eq!(report.loops_blocked, 1);

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.assigned_agent_id, None);
        let agent = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task_id.is_none());
        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);
        assert_eq!(monitor.cooldown.tracked().await, 0);
    }
}
