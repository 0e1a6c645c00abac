//! Execution session model.
//!
//! A session is one attempt at running a task on an agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Worker is executing
    Running,
    /// Worker reported success
    Completed,
    /// Worker reported failure
    Failed,
    /// Closed by the scheduler (dead agent, drift, intervention)
    Terminated,
}

impl SessionStatus {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Parse the stored form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Still `running`.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Assigned by the dispatcher
    pub id: Uuid,
    /// Agent that ran the session
    pub agent_id: Uuid,
    /// Task the session worked on
    pub task_id: Uuid,
    /// Current status
    pub status: SessionStatus,
    /// Why the session ended, when not a plain success
    pub reason: Option<String>,
    /// Tail of the worker output
    pub output: Option<String>,
    /// When the worker started
    pub started_at: DateTime<Utc>,
    /// Set when the session closes
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A new `running` session.
    pub fn start(id: Uuid, agent_id: Uuid, task_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            agent_id,
            task_id,
            status: SessionStatus::Running,
            reason: None,
            output: None,
            started_at,
            completed_at: None,
        }
    }

    /// Only running sessions may be closed, and only once.
    pub fn transition(&self, next: SessionStatus) -> DomainResult<()> {
        if self.status != SessionStatus::Running || next == SessionStatus::Running {
            return Err(DomainError::transition("session", self.status, next));
        }
        Ok(())
    }
}
