//! Agent model and its status machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Agent status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// No task
    Idle,
    /// Running a task
    Working,
    /// Working but silent past the stuck threshold
    Stuck,
}

impl AgentStatus {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Stuck => "stuck",
        }
    }

    /// `Stuck -> Working` is deliberately absent: a stuck agent only leaves
    /// that state through cleanup, even if its heartbeat resumes.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Working)
                | (Self::Working, Self::Idle)
                | (Self::Working, Self::Stuck)
                | (Self::Stuck, Self::Idle)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "stuck" => Ok(Self::Stuck),
            _ => Err(DomainError::InvalidValue(format!("Invalid agent status: {s}"))),
        }
    }
}

/// Target state for an agent status update, with its pointers.
///
/// The shape makes the pointer invariant unrepresentable to violate:
/// working always carries both pointers, idle carries none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAssignment {
    /// Release the task and session
    Idle,
    /// Take a task under a session
    Working {
        /// Task taken
        task_id: Uuid,
        /// Session it runs under
        session_id: Uuid,
    },
    /// Keeps whatever task/session pointers the agent already had.
    Stuck,
}

impl AgentAssignment {
    /// Status this assignment sets.
    pub fn status(&self) -> AgentStatus {
        match self {
            Self::Idle => AgentStatus::Idle,
            Self::Working { .. } => AgentStatus::Working,
            Self::Stuck => AgentStatus::Stuck,
        }
    }
}

/// A worker process slot that tasks are scheduled onto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier
    pub id: Uuid,

    /// Capability tag (e.g., "build", "qa")
    pub agent_type: String,

    /// Current agent status
    pub status: AgentStatus,

    /// Task the agent is executing (set iff working or stuck mid-task)
    pub current_task_id: Option<Uuid>,

    /// Session the agent is executing
    pub current_session_id: Option<Uuid>,

    /// Last heartbeat reported by the worker
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// When `status` last changed
    pub status_changed_at: DateTime<Utc>,
}

impl Agent {
    /// Create an idle agent
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type: agent_type.into(),
            status: AgentStatus::Idle,
            current_task_id: None,
            current_session_id: None,
            last_heartbeat: None,
            status_changed_at: Utc::now(),
        }
    }

    /// Validate a status change.
    pub fn transition(&self, next: &AgentAssignment) -> DomainResult<()> {
        if !self.status.can_transition_to(next.status()) {
            return Err(DomainError::transition("agent", self.status, next.status()));
        }
        Ok(())
    }

    /// Most recent liveness signal: the heartbeat, else the last status change.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.status_changed_at)
    }

    /// Whether the agent has been silent for longer than `threshold`.
    pub fn is_silent_for(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen() > threshold
    }

    /// Whether the agent is executing the given session of the given task.
    pub fn owns(&self, task_id: Uuid, session_id: Uuid) -> bool {
        self.status == AgentStatus::Working
            && self.current_task_id == Some(task_id)
            && self.current_session_id == Some(session_id)
    }

    /// Apply a status change in memory.
    pub fn apply(&mut self, next: &AgentAssignment, now: DateTime<Utc>) {
        match *next {
            AgentAssignment::Idle => {
                self.current_task_id = None;
                self.current_session_id = None;
            }
            AgentAssignment::Working { task_id, session_id } => {
                self.current_task_id = Some(task_id);
                self.current_session_id = Some(session_id);
            }
            AgentAssignment::Stuck => {}
        }
        if self.status != next.status() {
            self.status_changed_at = now;
        }
        self.status = next.status();
    }
}
