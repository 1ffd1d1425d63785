use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::{OwnerId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Persisted status of a task record.
///
/// State transitions:
/// - Idle -> Claiming (claim CAS) -> Running (mark running CAS)
/// - Running -> removed (one-off success)
/// - Running -> Idle (recurring success, or failure with retry budget left)
/// - Running -> Failed (retry budget exhausted; never claimed again)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Claiming,
    Running,
    Failed,
}

impl TaskStatus {
    /// Does this status count against a type's concurrency cap?
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Claiming | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Claiming => "claiming",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a point lookup used for diagnostics. Never used to decide a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLifecycle {
    NotFound,
    Status(TaskStatus),
}

impl fmt::Display for TaskLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskLifecycle::NotFound => f.write_str("notfound"),
            TaskLifecycle::Status(status) => status.fmt(f),
        }
    }
}

/// Recurrence for tasks that should run again after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    pub interval: Duration,
}

impl IntervalSchedule {
    pub fn every(interval: Duration) -> Self {
        Self { interval }
    }
}

/// What a caller hands to `schedule` / `ensure_scheduled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,

    pub task_type: TaskType,

    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub state: serde_json::Value,

    /// Defaults to "now" when scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<IntervalSchedule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
}

impl TaskInstance {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            id: None,
            task_type,
            params: serde_json::Value::Null,
            state: serde_json::Value::Null,
            run_at: None,
            schedule: None,
            scope: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_schedule(mut self, schedule: IntervalSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope.push(scope.into());
        self
    }

    /// Materialize as a fresh `Idle` instance. `id` must already be assigned.
    pub fn into_concrete(self, id: TaskId, now: DateTime<Utc>) -> ConcreteTaskInstance {
        ConcreteTaskInstance {
            id,
            task_type: self.task_type,
            params: self.params,
            state: self.state,
            status: TaskStatus::Idle,
            run_at: self.run_at.unwrap_or(now),
            scheduled_at: now,
            started_at: None,
            attempts: 0,
            retry_at: None,
            owner_id: None,
            schedule: self.schedule,
            scope: self.scope,
        }
    }
}

/// The logical fields of a task record: what runners, events and callers see.
/// The CAS version lives on `TaskRecord` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteTaskInstance {
    pub id: TaskId,
    pub task_type: TaskType,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub status: TaskStatus,
    pub run_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub owner_id: Option<OwnerId>,
    pub schedule: Option<IntervalSchedule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
}

/// A task that runs on the local instance without ever being stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralTask {
    pub task_type: TaskType,

    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub state: serde_json::Value,
}

impl EphemeralTask {
    pub fn new(task_type: TaskType, params: serde_json::Value) -> Self {
        Self {
            task_type,
            params,
            state: serde_json::Value::Null,
        }
    }

    /// Materialize as an instance already owned by (and running on) `owner`.
    pub fn into_concrete(
        self,
        id: TaskId,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> ConcreteTaskInstance {
        ConcreteTaskInstance {
            id,
            task_type: self.task_type,
            params: self.params,
            state: self.state,
            status: TaskStatus::Running,
            run_at: now,
            scheduled_at: now,
            started_at: Some(now),
            attempts: 0,
            retry_at: None,
            owner_id: Some(owner),
            schedule: None,
            scope: Vec::new(),
        }
    }
}
