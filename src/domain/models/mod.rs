//! Domain models.

pub mod agent;
pub mod config;
pub mod session;
pub mod task;
pub mod wave;

pub use agent::{Agent, AgentAssignment, AgentStatus};
pub use config::{
    Config, CrownConfig, DatabaseConfig, DispatchConfig, HealthConfig, LoggingConfig,
    NotificationConfig, RetryConfig, SchedulerConfig,
};
pub use session::{Session, SessionStatus};
pub use task::{Task, TaskPatch, TaskPriority, TaskStatus};
pub use wave::{WaveRun, WaveRunStatus, WaveStep};
