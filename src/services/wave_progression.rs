//! Wave progression for task lists executed wave by wave.

use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{WaveRun, WaveRunStatus, WaveStep};
use crate::domain::ports::{SchedulerStore, TaskFilter};
use crate::services::event_bus::{EventBus, EventPayload};

/// Moves wave runs forward once their current wave is terminal.
pub struct WaveProgressionController {
    store: Arc<dyn SchedulerStore>,
    events: Arc<EventBus>,
}

impl WaveProgressionController {
    /// Controller publishing wave events on `events`.
    pub fn new(store: Arc<dyn SchedulerStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Advance every running wave run whose current wave has finished.
    /// Returns the number of runs that moved.
    pub async fn check_progress(&self) -> DomainResult<usize> {
        let mut moved = 0;
        for run in self.store.get_wave_runs(Some(WaveRunStatus::Running)).await? {
            match self.advance(run).await {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "wave progression failed for run"),
            }
        }
        Ok(moved)
    }

    async fn advance(&self, mut run: WaveRun) -> DomainResult<bool> {
        let tasks = self
            .store
            .get_tasks(TaskFilter::wave(run.task_list_id, run.current_wave))
            .await?;
        // An empty wave is vacuously finished.
        if !tasks.iter().all(|t| t.status.is_terminal()) {
            return Ok(false);
        }

        let step = run.step();
        self.store.update_wave_run(&run).await?;
        match step {
            WaveStep::Advanced { wave } => {
                let task_count = self
                    .store
                    .get_tasks(TaskFilter::wave(run.task_list_id, wave))
                    .await?
                    .len();
                info!(wave_run_id = %run.id, wave, task_count, "wave started");
                self.events.publish(EventPayload::WaveStarted {
                    wave_run_id: run.id,
                    wave,
                    task_count,
                });
            }
            WaveStep::Completed => {
                info!(wave_run_id = %run.id, total_waves = run.total_waves, "wave run completed");
                self.events.publish(EventPayload::WaveCompleted {
                    wave_run_id: run.id,
                    total_waves: run.total_waves,
                });
            }
        }
        Ok(true)
    }
}
