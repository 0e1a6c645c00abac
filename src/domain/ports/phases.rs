//! Hooks for the tick phases owned by external collaborators.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::Task;

/// One externally provided tick phase (telemetry check, plan ingestion, QA
/// cycle, retry sweep).
#[async_trait]
pub trait PhaseHook: Send + Sync {
    /// Run the phase once.
    async fn run(&self) -> DomainResult<()>;
}

/// Decides which tasks the tick loop must never schedule.
pub trait ProductionGate: Send + Sync {
    /// True when `task` must stay out of scheduling.
    fn is_excluded(&self, task: &Task) -> bool;
}
