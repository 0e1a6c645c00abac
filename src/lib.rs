//! Crown - autonomous task scheduler
//!
//! Crown repeatedly matches pending tasks to idle agents, recovers from
//! silent or failing agents, advances wave-ordered task lists and runs a
//! slower supervisory pass ("crown") that blocks tasks needing a human.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Models, state machines and port traits
//! - **Adapters** (`adapters`): SQLite and in-memory stores, worker process
//!   dispatch, notification sinks
//! - **Service Layer** (`services`): Tick phases and the supervisory loop
//! - **Application Layer** (`application`): Runtime wiring and lifecycle
//! - **Infrastructure Layer** (`infrastructure`): Configuration and logging
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use crown::{Config, InMemoryStore, SchedulerRuntime};
//! use crown::adapters::CommandDispatcher;
//! use crown::domain::ports::NullNotifier;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let runtime = SchedulerRuntime::new(
//!         &config,
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(CommandDispatcher::new(config.dispatch.clone())),
//!         Arc::new(NullNotifier),
//!     );
//!     runtime.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.stop().await
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::{InMemoryStore, SqliteStore};
pub use application::{RuntimeState, SchedulerRuntime};
pub use domain::models::{
    Agent, AgentStatus, Config, Session, SessionStatus, Task, TaskPriority, TaskStatus, WaveRun,
    WaveRunStatus,
};
pub use domain::ports::{SchedulerStore, TaskFilter, WorkerDispatcher};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{CrownMonitor, CrownReport, TickScheduler, TickSummary};
