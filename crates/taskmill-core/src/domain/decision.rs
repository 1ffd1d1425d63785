//! Decision model: what completing a run does to the stored record.
//!
//! This module defines the Decision type (what to do next) and the Decider trait
//! (how to determine it from the task and the run outcome).

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::record::add_duration;
use super::{ConcreteTaskInstance, RetryPolicy, RunResult, RunnerError};

/// The completion to apply to a claimed record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// One-off task succeeded: delete the record.
    Remove,

    /// Run again later (recurring task, or the runner asked for `run_at`).
    Reschedule {
        run_at: DateTime<Utc>,
        state: serde_json::Value,
    },

    /// The run failed: count the attempt and back off (or fail past the limit).
    Retry { delay: Duration, error: String },
}

/// Decides the completion for a run.
///
/// Deciders are pure: no I/O, no mutation. Applying the decision is the store's job.
pub trait Decider: Send + Sync {
    fn decide(
        &self,
        task: &ConcreteTaskInstance,
        outcome: &Result<RunResult, RunnerError>,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Decision;
}

/// Default decider:
/// - success with `run_at` from the runner → reschedule there
/// - success of a recurring task → reschedule at `started_at + interval`
/// - success of a one-off task → remove
/// - failure → retry after `retry.next_delay(attempts + 1)`
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(
        &self,
        task: &ConcreteTaskInstance,
        outcome: &Result<RunResult, RunnerError>,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Decision {
        match outcome {
            Ok(result) => {
                if let Some(run_at) = result.run_at {
                    return Decision::Reschedule {
                        run_at,
                        state: result.state.clone(),
                    };
                }
                match task.schedule {
                    Some(schedule) => Decision::Reschedule {
                        run_at: add_duration(task.started_at.unwrap_or(now), schedule.interval),
                        state: result.state.clone(),
                    },
                    None => Decision::Remove,
                }
            }
            Err(err) => Decision::Retry {
                delay: retry.next_delay(task.attempts.saturating_add(1)),
                error: err.to_string(),
            },
        }
    }
}
