//! Scheduling services: the tick loop, its phases and the supervisory loop.

pub mod agent_health;
pub mod completion;
pub mod controls;
pub mod crash_protect;
pub mod crown_monitor;
pub mod event_bus;
pub mod production_gate;
pub mod retry_cooldown;
pub mod retry_sweep;
pub mod session_reconciler;
pub mod task_assignment;
pub mod tick_scheduler;
pub mod wave_progression;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent_health::{AgentHealthMonitor, HealthReport};
pub use completion::CompletionHandler;
pub use controls::ControlFlags;
pub use crash_protect::crash_protect;
pub use crown_monitor::{AgentStats, CrownMonitor, CrownReport};
pub use event_bus::{EventBus, EventPayload, SchedulerEvent};
pub use production_gate::CategoryGate;
pub use retry_cooldown::RetryCooldown;
pub use retry_sweep::RetryQueueSweep;
pub use session_reconciler::SessionReconciler;
pub use task_assignment::TaskAssignmentEngine;
pub use tick_scheduler::{PhaseHooks, TickScheduler, TickSummary};
pub use wave_progression::WaveProgressionController;
