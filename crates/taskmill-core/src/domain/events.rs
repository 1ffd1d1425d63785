//! Lifecycle events published by the polling and ephemeral lifecycles.
//!
//! Events are transient: they are broadcast in-process and never persisted. Every
//! event is keyed by task id so a caller awaiting one task can filter the merged
//! stream of both lifecycles.
//!
//! ```text
//! Claim(Ok)       claimed (persisted) or dequeued (ephemeral), run pending
//! Claim(Err)      requested id could not be claimed this cycle        [terminal]
//! RunRequest(Ok)  ephemeral task admitted to the local queue
//! RunRequest(Err) ephemeral queue full                                 [terminal]
//! Run(Ok|Err)     runner settled                                       [terminal]
//! ```

use chrono::{DateTime, Utc};

use super::{ConcreteTaskInstance, ErroredTask, RanTask, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimErrorType {
    /// The task's type is already at its `max_concurrency`.
    OutOfCapacity,
    /// Not claimed for another reason (missing, already owned, lost the CAS race).
    Unclaimable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimTaskErr {
    pub error_type: ClaimErrorType,
    pub task: Option<ConcreteTaskInstance>,
}

/// Backpressure: the ephemeral queue was full when the task was offered.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequestErr {
    pub capacity: usize,
    pub task: ConcreteTaskInstance,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEventKind {
    Claim(Result<ConcreteTaskInstance, ClaimTaskErr>),
    RunRequest(Result<ConcreteTaskInstance, RunRequestErr>),
    Run(Result<RanTask, ErroredTask>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub id: TaskId,
    pub at: DateTime<Utc>,
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn claim(
        id: TaskId,
        at: DateTime<Utc>,
        result: Result<ConcreteTaskInstance, ClaimTaskErr>,
    ) -> Self {
        Self {
            id,
            at,
            kind: TaskEventKind::Claim(result),
        }
    }

    pub fn run_request(
        id: TaskId,
        at: DateTime<Utc>,
        result: Result<ConcreteTaskInstance, RunRequestErr>,
    ) -> Self {
        Self {
            id,
            at,
            kind: TaskEventKind::RunRequest(result),
        }
    }

    pub fn run(id: TaskId, at: DateTime<Utc>, result: Result<RanTask, ErroredTask>) -> Self {
        Self {
            id,
            at,
            kind: TaskEventKind::Run(result),
        }
    }

    /// Does this event settle an awaiting caller?
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            TaskEventKind::Claim(result) => result.is_err(),
            TaskEventKind::RunRequest(result) => result.is_err(),
            TaskEventKind::Run(_) => true,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            TaskEventKind::Claim(Ok(_)) => "claim_ok",
            TaskEventKind::Claim(Err(_)) => "claim_err",
            TaskEventKind::RunRequest(Ok(_)) => "run_request_ok",
            TaskEventKind::RunRequest(Err(_)) => "run_request_err",
            TaskEventKind::Run(Ok(_)) => "run_ok",
            TaskEventKind::Run(Err(_)) => "run_err",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failures_and_runs_are_terminal() {
        let id = TaskId::new("a");
        let now = Utc::now();

        let claim_err = TaskEvent::claim(
            id.clone(),
            now,
            Err(ClaimTaskErr {
                error_type: ClaimErrorType::Unclaimable,
                task: None,
            }),
        );
        let ran = TaskEvent::run(
            id.clone(),
            now,
            Ok(RanTask {
                id: id.clone(),
                state: serde_json::Value::Null,
            }),
        );

        assert!(claim_err.is_terminal());
        assert!(ran.is_terminal());
        assert_eq!(ran.name(), "run_ok");
    }
}
