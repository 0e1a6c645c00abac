//! Task domain model.
//!
//! Tasks are units of work claimed by exactly one agent at a time. All status
//! changes go through [`Task::transition`], which rejects anything outside the
//! task state machine and produces the store patch to apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Status of a task in the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by an agent and executing
    InProgress,
    /// Worker finished, awaiting QA verification
    PendingVerification,
    /// Finished successfully
    Completed,
    /// Last attempt failed; may be retried
    Failed,
    /// Needs a human: retries exhausted or reassignment loop detected
    Blocked,
    /// Excluded task class, never scheduled
    Skipped,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::PendingVerification => "pending_verification",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the stored form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "pending_verification" => Some(Self::PendingVerification),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Whether a wave containing this task may be considered finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Blocked | Self::Skipped
        )
    }

    /// Valid transitions from this status.
    ///
    /// `InProgress -> Pending` covers claim release, stuck resets, orphan
    /// resets and dead-agent requeues. `Blocked` is reachable from any live
    /// status because loop detection must be able to stop a thrashing task
    /// wherever it is.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Blocked, Self::Skipped],
            Self::InProgress => &[
                Self::Completed,
                Self::Failed,
                Self::PendingVerification,
                Self::Pending,
                Self::Blocked,
            ],
            Self::PendingVerification => &[Self::Completed, Self::Failed],
            Self::Failed => &[Self::Pending, Self::Blocked],
            Self::Completed | Self::Blocked | Self::Skipped => &[],
        }
    }

    /// Whether `next` is a valid successor.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level, `P0` most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Most urgent
    P0 = 0,
    /// High
    P1 = 1,
    /// Normal
    P2 = 2,
    /// Low
    P3 = 3,
    /// Lowest
    P4 = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::P2
    }
}

impl TaskPriority {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
            Self::P4 => "P4",
        }
    }

    /// Parse the stored form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            "P4" => Some(Self::P4),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial update applied to a stored task.
///
/// `None` leaves a field untouched; the nested options on
/// `assigned_agent_id` and `failure_context` allow clearing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    /// New status
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the assignee
    pub assigned_agent_id: Option<Option<Uuid>>,
    /// New attempt count
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the context
    pub failure_context: Option<Option<String>>,
}

impl TaskPatch {
    /// Patch setting only the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Set or clear the assignee.
    pub fn assigned_to(mut self, agent_id: Option<Uuid>) -> Self {
        self.assigned_agent_id = Some(agent_id);
        self
    }

    /// Clear the assignee.
    pub fn unassigned(self) -> Self {
        self.assigned_to(None)
    }

    /// Set the attempt count.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Record why the last attempt failed.
    pub fn with_failure_context(mut self, context: impl Into<String>) -> Self {
        self.failure_context = Some(Some(context.into()));
        self
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A unit of work scheduled onto an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Human-facing identifier, e.g. `TASK-12`
    pub display_id: String,
    /// Current status
    pub status: TaskStatus,
    /// Priority
    pub priority: TaskPriority,
    /// Work category, drives agent-type preference
    pub category: String,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Retry ceiling
    pub max_retries: u32,
    /// Agent currently holding the claim
    pub assigned_agent_id: Option<Uuid>,
    /// Task list this task belongs to (wave runs key on it)
    pub task_list_id: Option<Uuid>,
    /// Wave partition within the task list
    pub wave_number: Option<u32>,
    /// Acceptance criteria checked by QA; opaque here
    pub pass_criteria: Option<String>,
    /// Last recorded failure cause
    pub failure_context: Option<String>,
    /// Arrival time, breaks priority ties
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A pending P2 task with three retries.
    pub fn new(display_id: impl Into<String>, category: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_id: display_id.into(),
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            category: category.into(),
            retry_count: 0,
            max_retries: 3,
            assigned_agent_id: None,
            task_list_id: None,
            wave_number: None,
            pass_criteria: None,
            failure_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Place the task in wave `wave_number` of a task list.
    pub fn with_wave(mut self, task_list_id: Uuid, wave_number: u32) -> Self {
        self.task_list_id = Some(task_list_id);
        self.wave_number = Some(wave_number);
        self
    }

    /// Completion then waits for QA verification.
    pub fn with_pass_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.pass_criteria = Some(criteria.into());
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate a transition and return the patch that effects it.
    pub fn transition(&self, next: TaskStatus) -> DomainResult<TaskPatch> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::transition("task", self.status, next));
        }
        Ok(TaskPatch::status(next))
    }

    /// Whether the retry ceiling has been reached.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Apply a patch in memory. Stores use this to keep one code path.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(agent) = patch.assigned_agent_id {
            self.assigned_agent_id = agent;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(context) = &patch.failure_context {
            self.failure_context.clone_from(context);
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::PendingVerification,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
            TaskStatus::Skipped,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::PendingVerification.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = Task::new("TASK-1", "feature");
        let patch = task.transition(TaskStatus::InProgress).unwrap();
        task.apply(&patch);
        let patch = task.transition(TaskStatus::PendingVerification).unwrap();
        task.apply(&patch);
        let patch = task.transition(TaskStatus::Completed).unwrap();
        task.apply(&patch);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_rejects_illegal_transitions() {
        let mut task = Task::new("TASK-1", "feature");
        task.status = TaskStatus::Blocked;
        assert!(matches!(
            task.transition(TaskStatus::InProgress),
            Err(DomainError::InvalidStateTransition { entity: "task", .. })
        ));

        task.status = TaskStatus::Pending;
        assert!(task.transition(TaskStatus::Completed).is_err());

        task.status = TaskStatus::Completed;
        assert!(task.transition(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_failed_can_retry_or_block() {
        let mut task = Task::new("TASK-2", "bug");
        task.status = TaskStatus::Failed;
        assert!(task.transition(TaskStatus::Pending).is_ok());
        assert!(task.transition(TaskStatus::Blocked).is_ok());
        assert!(task.transition(TaskStatus::InProgress).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::P0 < TaskPriority::P1);
        assert!(TaskPriority::P3 < TaskPriority::P4);
        assert_eq!(TaskPriority::from_str("p1"), Some(TaskPriority::P1));
    }

    #[test]
    fn test_patch_apply_clears_assignee() {
        let mut task = Task::new("TASK-3", "feature");
        let agent = Uuid::new_v4();
        task.apply(&TaskPatch::status(TaskStatus::InProgress).assigned_to(Some(agent)));
        assert_eq!(task.assigned_agent_id, Some(agent));

        task.apply(&TaskPatch::status(TaskStatus::Pending).unassigned());
        assert_eq!(task.assigned_agent_id, None);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut task = Task::new("TASK-4", "feature").with_max_retries(3);
        task.retry_count = 2;
        assert!(!task.retries_exhausted());
        task.retry_count = 3;
        assert!(task.retries_exhausted());
    }
}
