//! Error types.
//!
//! Loop-internal code passes these around as plain `Result` values. Only the
//! scheduling facade hands `TaskManagerError` back to callers.

use thiserror::Error;

use super::{TaskId, TaskLifecycle, TaskType};

/// Failures reported by a `TaskStore` backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The optimistic write lost a race (or the id already exists on insert).
    #[error("version conflict on task {id}")]
    VersionConflict { id: TaskId },

    #[error("task {id} not found")]
    NotFound { id: TaskId },

    /// Transient backend failure.
    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a task body: error, panic, decode failure or timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RunnerError(pub String);

impl RunnerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by the scheduling facade.
#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task type \"{0}\" is not registered")]
    UnknownTaskType(TaskType),

    #[error("invalid task: {0}")]
    Validation(String),

    #[error("middleware rejected task: {0}")]
    Middleware(String),

    #[error(
        "Failed to run task \"{id}\" as we would exceed the max concurrency of \"{title}\" which is {max_concurrency}. Rescheduled the task to ensure it is picked up as soon as possible."
    )]
    OutOfCapacity {
        id: TaskId,
        title: String,
        max_concurrency: usize,
    },

    #[error("Failed to run task \"{id}\" as it does not exist")]
    NotFound { id: TaskId },

    #[error("Failed to run task \"{id}\" as it is currently running")]
    AlreadyRunning { id: TaskId },

    #[error(
        "Failed to run task \"{id}\" for unknown reason (Current Task Lifecycle is \"{lifecycle}\")"
    )]
    UnknownReason { id: TaskId, lifecycle: TaskLifecycle },

    #[error("task \"{id}\" failed: {error}")]
    Runner { id: TaskId, error: String },

    #[error(
        "Ephemeral task \"{id}\" was rejected because the ephemeral queue is at capacity ({capacity})"
    )]
    EphemeralQueueFull { id: TaskId, capacity: usize },

    #[error("ephemeral tasks are disabled")]
    EphemeralDisabled,

    #[error("event stream closed while awaiting task \"{id}\"")]
    EventStreamClosed { id: TaskId },
}

impl TaskManagerError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, TaskManagerError::Store(StoreError::VersionConflict { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;

    #[test]
    fn out_of_capacity_message_is_actionable() {
        let err = TaskManagerError::OutOfCapacity {
            id: TaskId::new("B"),
            title: "Alerting".to_string(),
            max_concurrency: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("max concurrency"));
        assert!(msg.contains("which is 2"));
        assert!(msg.contains("Rescheduled"));
    }

    #[test]
    fn unknown_reason_names_the_lifecycle() {
        let err = TaskManagerError::UnknownReason {
            id: TaskId::new("x"),
            lifecycle: TaskLifecycle::Status(TaskStatus::Failed),
        };
        assert!(err.to_string().contains("\"failed\""));
    }

    #[test]
    fn version_conflict_is_detectable_through_the_facade_error() {
        let err: TaskManagerError = StoreError::VersionConflict {
            id: TaskId::new("c"),
        }
        .into();
        assert!(err.is_version_conflict());
    }
}
