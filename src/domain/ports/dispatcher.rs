//! Worker dispatch port.
//!
//! Spawning returns as soon as the worker has started (or failed to). The
//! eventual outcome arrives later on the handle's completion channel, so the
//! caller never blocks on the worker itself.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnRequest {
    /// Execute a claimed task on an agent
    Task {
        /// Claimed task
        task_id: Uuid,
        /// Agent holding the claim
        agent_id: Uuid,
    },
    /// Run an investigative worker with a prompt
    Diagnostic {
        /// Investigation prompt, written to stdin
        prompt: String,
        /// Model label for the worker
        model: String,
        /// Hard time limit
        timeout_secs: u64,
        /// Name for logs and the session
        label: String,
    },
}

/// Final result of a worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exit status zero
    Succeeded {
        /// Output tail
        output: Option<String>,
    },
    /// Non-zero exit, timeout or lost worker
    Failed {
        /// Failure description
        error: String,
        /// Output tail
        output: Option<String>,
    },
}

impl WorkerOutcome {
    /// Worker exited successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Captured output tail, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Succeeded { output } | Self::Failed { output, .. } => output.as_deref(),
        }
    }
}

/// A started worker.
#[derive(Debug)]
pub struct DispatchHandle {
    /// Session the worker runs under
    pub session_id: Uuid,
    /// Resolves once the worker exits
    pub completion: oneshot::Receiver<WorkerOutcome>,
}

/// Spawn failure.
///
/// `session_id` is `None` when the worker never started; the claim can then
/// be released without counting an attempt.
#[derive(Debug, Clone, Error)]
#[error("dispatch failed: {error}")]
pub struct DispatchFailure {
    /// Set when the worker had already started
    pub session_id: Option<Uuid>,
    /// What went wrong
    pub error: String,
}

impl DispatchFailure {
    /// The worker never started.
    pub fn before_start(error: impl Into<String>) -> Self {
        Self {
            session_id: None,
            error: error.into(),
        }
    }

    /// The worker started under `session_id`, then died.
    pub fn after_start(session_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id),
            error: error.into(),
        }
    }

    /// Whether an attempt should be counted.
    pub fn started(&self) -> bool {
        self.session_id.is_some()
    }
}

/// Completion report routed back into the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Session the worker ran under
    pub session_id: Uuid,
    /// Task it worked on
    pub task_id: Uuid,
    /// Agent that held the task
    pub agent_id: Uuid,
    /// How it ended
    pub outcome: WorkerOutcome,
}

/// Starts workers for tasks and diagnostic requests.
///
/// `spawn` returns once the worker is running; the outcome arrives later on
/// [`DispatchHandle::completion`].
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Start a worker for `request`.
    async fn spawn(&self, request: SpawnRequest) -> Result<DispatchHandle, DispatchFailure>;
}
