//! Domain model (ids, task instances, records, claims, events, errors, retry).
//!
//! Nothing in here does I/O. Store backends and the lifecycles build on these types
//! and transitions so that every backend claims and completes tasks the same way.

pub mod claim;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod record;
pub mod retry;
pub mod task;

pub use claim::{
    ClaimOutcome, ClaimPlan, ClaimPolicy, ClaimRequest, ClaimStats, ClaimTransition, apply_claim,
};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{RunnerError, StoreError, TaskManagerError};
pub use events::{ClaimErrorType, ClaimTaskErr, RunRequestErr, TaskEvent, TaskEventKind};
pub use ids::{OwnerId, TaskId};
pub use outcome::{ErroredTask, RanTask, RunNowResult, RunResult};
pub use record::{TaskRecord, Version, add_duration};
pub use retry::{Jitter, RetryPolicy};
pub use task::{
    ConcreteTaskInstance, EphemeralTask, IntervalSchedule, TaskInstance, TaskLifecycle,
    TaskStatus, TaskType,
};
