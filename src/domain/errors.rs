//! Domain errors for the crown scheduler.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur while scheduling.
#[derive(Debug, Error)]
pub enum DomainError {
    /// No task with this id
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No agent with this id
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// No wave run with this id
    #[error("Wave run not found: {0}")]
    WaveRunNotFound(Uuid),

    /// Transition not allowed by the state machine
    #[error("Invalid {entity} state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Kind of entity
        entity: &'static str,
        /// Current status
        from: String,
        /// Rejected target status
        to: String,
    },

    /// Malformed or duplicate value
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Store failure
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Could not encode or decode a value
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Worker could not be dispatched
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),
}

/// Result alias for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Build an `InvalidStateTransition` for the named entity.
    pub fn transition(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
