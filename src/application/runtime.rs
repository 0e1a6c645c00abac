//! Scheduler runtime.
//!
//! Wires the services together and owns the two background loops: the tick
//! loop (which also drains worker completions) and the crown loop. Both share
//! the same `Arc`-held collaborators and stop on one broadcast signal.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::Config;
use crate::domain::ports::{Notifier, SchedulerStore, WorkerDispatcher, WorkerReport};
use crate::services::{
    AgentHealthMonitor, CategoryGate, CompletionHandler, ControlFlags, CrownMonitor, EventBus,
    PhaseHooks, RetryCooldown, SessionReconciler, TaskAssignmentEngine, TickScheduler,
    WaveProgressionController,
};

const REPORT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a [`SchedulerRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Loops not running
    Stopped,
    /// Loops being spawned
    Starting,
    /// Both loops active
    Running,
    /// Waiting for the loops to exit
    Stopping,
}

/// Owns the services and runs the tick and crown loops as background tasks.
pub struct SchedulerRuntime {
    state: RwLock<RuntimeState>,
    tick: Arc<TickScheduler>,
    crown: Arc<CrownMonitor>,
    events: Arc<EventBus>,
    controls: ControlFlags,
    completion: Arc<CompletionHandler>,
    reports_rx: Mutex<Option<mpsc::Receiver<WorkerReport>>>,
    shutdown_tx: broadcast::Sender<()>,
    tick_handle: Mutex<Option<JoinHandle<DomainResult<()>>>>,
    crown_handle: Mutex<Option<JoinHandle<DomainResult<()>>>>,
}

impl SchedulerRuntime {
    /// Wire every service with the default phase hooks.
    pub fn new(
        config: &Config,
        store: Arc<dyn SchedulerStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_hooks(config, store, dispatcher, notifier, PhaseHooks::default())
    }

    /// Like [`SchedulerRuntime::new`] with caller-supplied phase hooks.
    pub fn with_hooks(
        config: &Config,
        store: Arc<dyn SchedulerStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        notifier: Arc<dyn Notifier>,
        hooks: PhaseHooks,
    ) -> Self {
        let events = Arc::new(EventBus::default());
        let cooldown = Arc::new(RetryCooldown::new(config.retry.clone()));
        let controls = ControlFlags::new(config.scheduler.spawning_enabled);
        let completion = Arc::new(CompletionHandler::new(
            store.clone(),
            cooldown.clone(),
            events.clone(),
        ));
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let assignment = TaskAssignmentEngine::new(
            store.clone(),
            dispatcher.clone(),
            Arc::new(CategoryGate::from_config(&config.scheduler)),
            cooldown.clone(),
            events.clone(),
            completion.clone(),
            reports_tx,
            controls.clone(),
            config.scheduler.clone(),
        );
        let tick = TickScheduler::new(
            store.clone(),
            events.clone(),
            controls.clone(),
            config.scheduler.clone(),
            AgentHealthMonitor::new(
                store.clone(),
                events.clone(),
                notifier.clone(),
                config.health.clone(),
            ),
            SessionReconciler::new(store.clone(), config.scheduler.session_grace_secs),
            WaveProgressionController::new(store.clone(), events.clone()),
            assignment,
            completion.clone(),
        )
        .with_hooks(hooks);
        let crown = CrownMonitor::new(
            store,
            dispatcher,
            cooldown,
            events.clone(),
            notifier,
            config,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state: RwLock::new(RuntimeState::Stopped),
            tick: Arc::new(tick),
            crown: Arc::new(crown),
            events,
            controls,
            completion,
            reports_rx: Mutex::new(Some(reports_rx)),
            shutdown_tx,
            tick_handle: Mutex::new(None),
            crown_handle: Mutex::new(None),
        }
    }

    /// The tick loop service, for one-shot ticks.
    pub fn tick_scheduler(&self) -> &Arc<TickScheduler> {
        &self.tick
    }

    /// The supervisory service, for one-shot passes.
    pub fn crown_monitor(&self) -> &Arc<CrownMonitor> {
        &self.crown
    }

    /// Bus every service publishes to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Pause and spawning switches.
    pub fn controls(&self) -> &ControlFlags {
        &self.controls
    }

    /// Handler applying worker reports and QA verdicts.
    pub fn completion(&self) -> &Arc<CompletionHandler> {
        &self.completion
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Drain worker reports already queued, without waiting for more.
    /// One-shot commands use this instead of the tick loop.
    pub async fn drain_reports(&self) -> Result<usize> {
        let mut guard = self.reports_rx.lock().await;
        let rx = guard
            .as_mut()
            .context("report receiver taken by the running tick loop")?;
        let mut applied = 0;
        while let Ok(report) = rx.try_recv() {
            if let Err(e) = self.completion.handle(report).await {
                warn!(error = %e, "failed to apply worker report");
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Wait up to `limit` for `expected` worker reports and apply them.
    /// Returns how many were applied; fewer means the deadline passed.
    pub async fn await_reports(&self, expected: usize, limit: Duration) -> Result<usize> {
        let mut guard = self.reports_rx.lock().await;
        let rx = guard
            .as_mut()
            .context("report receiver taken by the running tick loop")?;
        let deadline = tokio::time::Instant::now() + limit;
        let mut applied = 0;
        while applied < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(report)) => {
                    if let Err(e) = self.completion.handle(report).await {
                        warn!(error = %e, "failed to apply worker report");
                    }
                    applied += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(applied)
    }

    /// Spawn the tick loop and the crown loop.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != RuntimeState::Stopped {
            return Ok(());
        }
        *state = RuntimeState::Starting;

        let reports = self
            .reports_rx
            .lock()
            .await
            .take()
            .context("Worker report receiver already taken")?;

        let tick = Arc::clone(&self.tick);
        let shutdown = self.shutdown_tx.subscribe();
        *self.tick_handle.lock().await =
            Some(tokio::spawn(async move { tick.run(reports, shutdown).await }));

        let crown = Arc::clone(&self.crown);
        let shutdown = self.shutdown_tx.subscribe();
        *self.crown_handle.lock().await = Some(tokio::spawn(async move { crown.run(shutdown).await }));

        *state = RuntimeState::Running;
        info!("scheduler runtime started");
        Ok(())
    }

    /// Signal both loops and wait for them, each with a bounded timeout.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == RuntimeState::Stopped {
            return Ok(());
        }
        *state = RuntimeState::Stopping;

        info!("stopping scheduler runtime");
        let _ = self.shutdown_tx.send(());

        for (name, slot) in [("tick", &self.tick_handle), ("crown", &self.crown_handle)] {
            let Some(handle) = slot.lock().await.take() else {
                continue;
            };
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => info!(loop_name = name, "loop stopped cleanly"),
                Ok(Ok(Err(e))) => warn!(loop_name = name, error = %e, "loop returned error"),
                Ok(Err(e)) => warn!(loop_name = name, error = ?e, "loop panicked"),
                Err(_) => warn!(loop_name = name, "loop shutdown timeout"),
            }
        }

        *state = RuntimeState::Stopped;
        info!("scheduler runtime stopped");
        Ok(())
    }
}
