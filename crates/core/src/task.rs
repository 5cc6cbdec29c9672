//! Task entity, lifecycle state machine, and queue payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// # Invariants
/// - `Pending` precedes `Processing` precedes a terminal state.
/// - `Success` and `Failed` are terminal: no write may leave them.
/// - Re-applying `Processing` to a `Processing` row is legal (duplicate
///   deliveries re-claim the same row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Whether a transition from `self` to `next` is legal under the
    /// lifecycle state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Success)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task row as persisted in the store and served to clients.
///
/// `result_file` is set iff the task succeeded; `error_message` is set iff it
/// failed. `user_id` never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub result_file: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue message payload published on enqueue and consumed by workers.
///
/// The retry counter is not part of the payload: it travels as a message
/// header on the transport envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: i64,
    pub user_id: i64,
    pub task_type: String,
}

/// Validate a task type submitted through the gateway.
///
/// Only emptiness is checked here; whether the type is actually executable is
/// decided by the worker's handler registry.
pub fn validate_task_type(task_type: &str) -> Result<(), crate::ServiceError> {
    if task_type.trim().is_empty() {
        return Err(crate::ServiceError::validation("task_type is required"));
    }
    Ok(())
}
