//! Wave run model.
//!
//! A wave run walks a task list wave by wave; wave `n` holds the tasks whose
//! `wave_number` is `n`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a wave run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveRunStatus {
    /// Waves still open
    Running,
    /// Last wave finished
    Completed,
}

impl WaveRunStatus {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    /// Parse the stored form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Progress of one task list through its waves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveRun {
    /// Run id
    pub id: Uuid,
    /// Task list being walked
    pub task_list_id: Uuid,
    /// 1-based, only ever increases
    pub current_wave: u32,
    /// Number of waves in the list
    pub total_waves: u32,
    /// Running until the last wave finishes
    pub status: WaveRunStatus,
    /// Last step
    pub updated_at: DateTime<Utc>,
}

/// What happened when a finished wave was closed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveStep {
    /// Moved to a later wave
    Advanced {
        /// Wave now open
        wave: u32,
    },
    /// Last wave finished
    Completed,
}

impl WaveRun {
    /// A run starting at wave 1.
    pub fn new(task_list_id: Uuid, total_waves: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_list_id,
            current_wave: 1,
            total_waves,
            status: WaveRunStatus::Running,
            updated_at: Utc::now(),
        }
    }

    /// Close out the current wave: move to the next one or finish the run.
    pub fn step(&mut self) -> WaveStep {
        self.updated_at = Utc::now();
        if self.current_wave < self.total_waves {
            self.current_wave += 1;
            WaveStep::Advanced {
                wave: self.current_wave,
            }
        } else {
            self.status = WaveRunStatus::Completed;
            WaveStep::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_advances_then_completes() {
        let mut run = WaveRun::new(Uuid::new_v4(), 2);
        assert_eq!(run.step(), WaveStep::Advanced { wave: 2 });
        assert_eq!(run.status, WaveRunStatus::Running);
        assert_eq!(run.step(), WaveStep::Completed);
        assert_eq!(run.status, WaveRunStatus::Completed);
        assert_eq!(run.current_wave, 2);
    }
}
