//! Port trait definitions (Hexagonal Architecture)
//!
//! - SchedulerStore: durable tasks, agents, sessions and wave runs
//! - WorkerDispatcher: launches workers and reports their outcome
//! - Notifier: best-effort alerts
//! - PhaseHook / ProductionGate: externally owned tick phases and filters

pub mod dispatcher;
pub mod notifier;
pub mod phases;
pub mod store;

pub use dispatcher::{
    DispatchFailure, DispatchHandle, SpawnRequest, WorkerDispatcher, WorkerOutcome, WorkerReport,
};
pub use notifier::{Notifier, NullNotifier};
pub use phases::{PhaseHook, ProductionGate};
pub use store::{SchedulerStore, TaskFilter};
