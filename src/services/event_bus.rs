//! EventBus for scheduler events.
//!
//! Broadcast-based fan-out with sequence numbering. Dashboards, the CLI and
//! tests subscribe; publishing never blocks and never fails when nobody is
//! listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    /// Routine detail
    Debug,
    /// Normal progress
    Info,
    /// Recovered problem
    Warning,
    /// Needs attention
    Error,
}

/// Event category for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Tick loop
    Scheduler,
    /// Task lifecycle
    Task,
    /// Agent health
    Agent,
    /// Wave runs
    Wave,
    /// Supervisory interventions
    Crown,
}

/// Event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// Unique id
    pub id: EventId,
    /// Publication order
    pub sequence: SequenceNumber,
    /// When it was published
    pub timestamp: DateTime<Utc>,
    /// Derived from the payload
    pub severity: EventSeverity,
    /// Derived from the payload
    pub category: EventCategory,
    /// What happened
    pub payload: EventPayload,
}

/// Scheduler events. Serialized as `{"type": "task-assigned", "data": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EventPayload {
    /// A worker was dispatched for a task
    TaskAssigned {
        /// Task concerned
        task_id: Uuid,
        /// Human-readable task id
        display_id: String,
        /// Agent concerned
        agent_id: Uuid,
        /// Worker session
        session_id: Uuid,
    },
    /// A worker finished successfully
    TaskCompleted {
        /// Task concerned
        task_id: Uuid,
        /// Human-readable task id
        display_id: String,
        /// Waiting for QA instead of completed
        awaiting_verification: bool,
    },
    /// A worker or verification failed
    TaskFailed {
        /// Task concerned
        task_id: Uuid,
        /// Human-readable task id
        display_id: String,
        /// Failure description
        error: String,
        /// Attempts so far
        retry_count: u32,
    },
    /// A task ran out of retries and was blocked
    RetryExhausted {
        /// Task concerned
        task_id: Uuid,
        /// Human-readable task id
        display_id: String,
        /// Attempts so far
        retry_count: u32,
    },
    /// Reassignment loop detected
    TaskBlocked {
        /// Task concerned
        task_id: Uuid,
        /// Human-readable task id
        display_id: String,
        /// Why it was blocked
        reason: String,
    },
    /// End of a tick
    TickSummary {
        /// Tick number
        tick: u64,
        /// Working agents after the tick
        working_agents: usize,
        /// Idle agents after the tick
        idle_agents: usize,
        /// Workers dispatched this tick
        tasks_assigned: usize,
    },
    /// A wave run moved to its next wave
    WaveStarted {
        /// Wave run concerned
        wave_run_id: Uuid,
        /// Wave now open
        wave: u32,
        /// Tasks in that wave
        task_count: usize,
    },
    /// A wave run finished its last wave
    WaveCompleted {
        /// Wave run concerned
        wave_run_id: Uuid,
        /// Waves in the run
        total_waves: u32,
    },
    /// An agent was found faulty
    AgentError {
        /// Agent concerned
        agent_id: Uuid,
        /// Failure description
        error: String,
    },
    /// Dead agent cleaned up
    AgentRecovered {
        /// Agent concerned
        agent_id: Uuid,
        /// Task returned to pending, if any
        requeued_task_id: Option<Uuid>,
    },
    /// Crown reset a silent working agent
    AgentStuckReset {
        /// Agent concerned
        agent_id: Uuid,
        /// Task concerned
        task_id: Option<Uuid>,
    },
    /// A diagnostic worker was started for a blocked task
    DiagnosisDispatched {
        /// Task concerned
        task_id: Uuid,
        /// Human-readable task id
        display_id: String,
        /// Worker session
        session_id: Uuid,
    },
}

impl EventPayload {
    /// Wire name, e.g. `task-assigned`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskAssigned { .. } => "task-assigned",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
            Self::RetryExhausted { .. } => "retry-exhausted",
            Self::TaskBlocked { .. } => "task-blocked",
            Self::TickSummary { .. } => "tick-summary",
            Self::WaveStarted { .. } => "wave-started",
            Self::WaveCompleted { .. } => "wave-completed",
            Self::AgentError { .. } => "agent-error",
            Self::AgentRecovered { .. } => "agent-recovered",
            Self::AgentStuckReset { .. } => "agent-stuck-reset",
            Self::DiagnosisDispatched { .. } => "diagnosis-dispatched",
        }
    }

    fn classify(&self) -> (EventSeverity, EventCategory) {
        match self {
            Self::TaskAssigned { .. } | Self::TaskCompleted { .. } => {
                (EventSeverity::Info, EventCategory::Task)
            }
            Self::TaskFailed { .. } => (EventSeverity::Warning, EventCategory::Task),
            Self::RetryExhausted { .. } | Self::TaskBlocked { .. } => {
                (EventSeverity::Error, EventCategory::Crown)
            }
            Self::TickSummary { .. } => (EventSeverity::Debug, EventCategory::Scheduler),
            Self::WaveStarted { .. } | Self::WaveCompleted { .. } => {
                (EventSeverity::Info, EventCategory::Wave)
            }
            Self::AgentError { .. } => (EventSeverity::Error, EventCategory::Agent),
            Self::AgentRecovered { .. } => (EventSeverity::Warning, EventCategory::Agent),
            Self::AgentStuckReset { .. } => (EventSeverity::Warning, EventCategory::Crown),
            Self::DiagnosisDispatched { .. } => (EventSeverity::Info, EventCategory::Crown),
        }
    }
}

/// Central event bus for broadcasting events to multiple consumers.
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Wrap a payload in an envelope and broadcast it.
    pub fn publish(&self, payload: EventPayload) -> SequenceNumber {
        let sequence = SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst));
        let (severity, category) = payload.classify();
        tracing::debug!(event = payload.kind(), %sequence, "event published");

        let event = SchedulerEvent {
            id: EventId::new(),
            sequence,
            timestamp: Utc::now(),
            severity,
            category,
            payload,
        };
        // No subscribers is fine.
        let _ = self.sender.send(event);
        sequence
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Next sequence number to be assigned.
    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    /// Live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_sequence_assignment() {
        let bus = EventBus::default();
        assert_eq!(bus.current_sequence().0, 0);

        let mut rx = bus.subscribe();
        bus.publish(EventPayload::WaveCompleted {
            wave_run_id: Uuid::new_v4(),
            total_waves: 2,
        });
        bus.publish(EventPayload::AgentError {
            agent_id: Uuid::new_v4(),
            error: "boom".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence.0, 0);
        assert_eq!(second.sequence.0, 1);
        assert_eq!(second.severity, EventSeverity::Error);
        assert_eq!(bus.current_sequence().0, 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        let seq = bus.publish(EventPayload::TickSummary {
            tick: 1,
            working_agents: 0,
            idle_agents: 0,
            tasks_assigned: 0,
        });
        assert_eq!(seq.0, 0);
    }

    #[test]
    fn test_payload_serializes_with_kebab_tag() {
        let payload = EventPayload::RetryExhausted {
            task_id: Uuid::nil(),
            display_id: "TASK-9".into(),
            retry_count: 3,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "retry-exhausted");
        assert_eq!(json["data"]["retry_count"], 3);
        assert_eq!(payload.kind(), "retry-exhausted");
    }
}
