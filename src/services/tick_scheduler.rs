//! The fixed-interval scheduling loop.
//!
//! Each tick runs its phases in a fixed order, every phase wrapped in
//! [`crash_protect`] so a failing phase never stops the ones after it.
//! Worker completions arrive on a channel and are applied between ticks.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::domain::errors::DomainResult;
use crate::domain::models::SchedulerConfig;
use crate::domain::ports::{PhaseHook, SchedulerStore, WorkerReport};
use crate::services::agent_health::{AgentHealthMonitor, HealthReport};
use crate::services::completion::CompletionHandler;
use crate::services::controls::ControlFlags;
use crate::services::crash_protect::crash_protect;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::retry_sweep::RetryQueueSweep;
use crate::services::session_reconciler::SessionReconciler;
use crate::services::task_assignment::TaskAssignmentEngine;
use crate::services::wave_progression::WaveProgressionController;

/// Phases owned by external collaborators. Unset hooks are skipped.
#[derive(Clone, Default)]
pub struct PhaseHooks {
    /// Runs first
    pub telemetry: Option<Arc<dyn PhaseHook>>,
    /// Only when planning is enabled
    pub planning: Option<Arc<dyn PhaseHook>>,
    /// Only when QA is enabled
    pub qa: Option<Arc<dyn PhaseHook>>,
    /// Defaults to [`RetryQueueSweep`]
    pub retry_sweep: Option<Arc<dyn PhaseHook>>,
}

/// Outcome of one tick. Phase fields are `None` when the phase did not run
/// or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// 1-based tick number
    pub tick: u64,
    /// The tick was skipped
    pub paused: bool,
    /// From the health check
    pub marked_stuck: Option<usize>,
    /// Dead agents reset by the health check
    pub agents_cleaned: Option<usize>,
    /// From session reconciliation
    pub sessions_terminated: Option<usize>,
    /// Wave runs that moved
    pub waves_advanced: Option<usize>,
    /// Workers dispatched
    pub tasks_assigned: usize,
    /// Working agents after the tick
    pub working_agents: usize,
    /// Idle agents after the tick
    pub idle_agents: usize,
}

/// The per-tick pipeline and its loop.
pub struct TickScheduler {
    store: Arc<dyn SchedulerStore>,
    events: Arc<EventBus>,
    controls: ControlFlags,
    config: SchedulerConfig,
    health: AgentHealthMonitor,
    reconciler: SessionReconciler,
    waves: WaveProgressionController,
    assignment: TaskAssignmentEngine,
    completion: Arc<CompletionHandler>,
    hooks: PhaseHooks,
    tick_count: AtomicU64,
}

impl TickScheduler {
    /// Scheduler with the default retry sweep and no other hooks.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        events: Arc<EventBus>,
        controls: ControlFlags,
        config: SchedulerConfig,
        health: AgentHealthMonitor,
        reconciler: SessionReconciler,
        waves: WaveProgressionController,
        assignment: TaskAssignmentEngine,
        completion: Arc<CompletionHandler>,
    ) -> Self {
        let hooks = PhaseHooks {
            retry_sweep: Some(Arc::new(RetryQueueSweep::new(store.clone()))),
            ..PhaseHooks::default()
        };
        Self {
            store,
            events,
            controls,
            config,
            health,
            reconciler,
            waves,
            assignment,
            completion,
            hooks,
            tick_count: AtomicU64::new(0),
        }
    }

    /// Install a telemetry hook.
    pub fn with_telemetry(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.hooks.telemetry = Some(hook);
        self
    }

    /// Install a planning hook.
    pub fn with_planning(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.hooks.planning = Some(hook);
        self
    }

    /// Install a QA hook.
    pub fn with_qa(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.hooks.qa = Some(hook);
        self
    }

    /// Replace the default [`RetryQueueSweep`].
    pub fn with_retry_sweep(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.hooks.retry_sweep = Some(hook);
        self
    }

    /// Install every hook that is set; the default retry sweep stays unless
    /// replaced.
    pub fn with_hooks(mut self, hooks: PhaseHooks) -> Self {
        let PhaseHooks {
            telemetry,
            planning,
            qa,
            retry_sweep,
        } = hooks;
        self.hooks.telemetry = telemetry.or(self.hooks.telemetry.take());
        self.hooks.planning = planning.or(self.hooks.planning.take());
        self.hooks.qa = qa.or(self.hooks.qa.take());
        self.hooks.retry_sweep = retry_sweep.or(self.hooks.retry_sweep.take());
        self
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Run every phase once, in order. A failing phase is logged and the
    /// remaining phases still run.
    pub async fn tick(&self) -> TickSummary {
        if self.controls.is_paused() {
            debug!("scheduler paused, tick skipped");
            return TickSummary {
                tick: self.ticks(),
                paused: true,
                ..TickSummary::default()
            };
        }
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut summary = TickSummary {
            tick,
            ..TickSummary::default()
        };

        if let Some(hook) = &self.hooks.telemetry {
            crash_protect("telemetry", hook.run()).await;
        }
        if self.config.planning_enabled {
            if let Some(hook) = &self.hooks.planning {
                crash_protect("planning", hook.run()).await;
            }
        }

        let health: Option<HealthReport> =
            crash_protect("agent-health", self.health.check_at(Utc::now())).await;
        summary.marked_stuck = health.map(|h| h.marked_stuck);
        summary.agents_cleaned = health.map(|h| h.cleaned);

        summary.sessions_terminated =
            crash_protect("session-reconcile", self.reconciler.reconcile()).await;

        if self.config.qa_enabled && every(tick, self.config.qa_every_n_ticks) {
            if let Some(hook) = &self.hooks.qa {
                crash_protect("qa", hook.run()).await;
            }
        }
        if every(tick, self.config.retry_sweep_every_n_ticks) {
            if let Some(hook) = &self.hooks.retry_sweep {
                crash_protect("retry-sweep", hook.run()).await;
            }
        }

        summary.waves_advanced = crash_protect("wave-progress", self.waves.check_progress()).await;
        summary.tasks_assigned = crash_protect("assignment", self.assignment.assign())
            .await
            .unwrap_or(0);

        if let Some((working, idle)) = crash_protect("tick-summary", self.agent_counts()).await {
            summary.working_agents = working;
            summary.idle_agents = idle;
        }
        self.events.publish(EventPayload::TickSummary {
            tick,
            working_agents: summary.working_agents,
            idle_agents: summary.idle_agents,
            tasks_assigned: summary.tasks_assigned,
        });
        debug!(
            tick,
            assigned = summary.tasks_assigned,
            working = summary.working_agents,
            idle = summary.idle_agents,
            "tick complete"
        );
        summary
    }

    async fn agent_counts(&self) -> DomainResult<(usize, usize)> {
        let working = self.store.get_working_agents().await?.len();
        let idle = self.store.get_idle_agents().await?.len();
        Ok((working, idle))
    }

    /// Tick on the configured interval and apply worker reports until
    /// shutdown is signalled.
    pub async fn run(
        &self,
        mut reports: mpsc::Receiver<WorkerReport>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> DomainResult<()> {
        let mut ticker = interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.config.tick_interval_secs, "tick loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(report) = reports.recv() => {
                    crash_protect("completion", self.completion.handle(report)).await;
                }
                _ = shutdown.recv() => {
                    info!("tick loop received shutdown signal");
                    break;
                }
            }
        }
        info!(ticks = self.ticks(), "tick loop stopped");
        Ok(())
    }
}

fn every(tick: u64, n: u64) -> bool {
    n > 0 && tick % n == 0
}
