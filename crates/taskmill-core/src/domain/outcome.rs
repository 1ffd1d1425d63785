//! Outcome model: what a runner returns and what a run event reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Returned by a successful `TaskRunner::run`.
///
/// - `state` replaces the stored state (recurring tasks carry it to the next run).
/// - `run_at` asks for another run at that time, even for tasks without a schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub state: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn with_state(state: serde_json::Value) -> Self {
        Self {
            state,
            run_at: None,
        }
    }

    pub fn run_again_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Payload of a successful run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RanTask {
    pub id: TaskId,
    pub state: serde_json::Value,
}

/// Payload of a failed run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErroredTask {
    pub id: TaskId,
    pub error: String,
}

/// What `run_now` / `ephemeral_run_now` resolve with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNowResult {
    pub id: TaskId,
    pub state: serde_json::Value,
}

impl From<RanTask> for RunNowResult {
    fn from(ran: RanTask) -> Self {
        Self {
            id: ran.id,
            state: ran.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_result_defaults_are_empty() {
        let result: RunResult = serde_json::from_str("{}").unwrap();
        assert!(result.state.is_null());
        assert!(result.run_at.is_none());
    }
}
