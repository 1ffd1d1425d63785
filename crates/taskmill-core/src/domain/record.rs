//! Task record: logical instance + CAS version.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConcreteTaskInstance, OwnerId, TaskStatus};

/// Optimistic concurrency token (sequence number / primary term pair).
///
/// Every successful write yields a new version. A write that supplies a version
/// other than the stored one is rejected, so whichever writer holds the last read
/// version is the only one that may mutate the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub seq_no: u64,
    pub primary_term: u64,
}

impl Version {
    pub fn new(seq_no: u64, primary_term: u64) -> Self {
        Self {
            seq_no,
            primary_term,
        }
    }
}

/// A stored task: the single source of truth for its state.
///
/// All state transitions happen through the methods below; the store only decides
/// whether the resulting write is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub instance: ConcreteTaskInstance,
    pub version: Version,
}

impl TaskRecord {
    pub fn new(instance: ConcreteTaskInstance, version: Version) -> Self {
        Self { instance, version }
    }

    /// Claiming is the only transition that changes ownership.
    ///
    /// The claim gets its own lease so an owner that dies before running the task
    /// does not hold it forever.
    pub fn claim(&mut self, owner: OwnerId, now: DateTime<Utc>, lease: Duration) {
        self.instance.status = TaskStatus::Claiming;
        self.instance.owner_id = Some(owner);
        self.instance.started_at = Some(now);
        self.instance.retry_at = Some(add_duration(now, lease));
    }

    /// `retry_at` doubles as the claim lease: past it, the claim is considered stale.
    ///
    /// Callers pass a lease longer than the run timeout so the owner can still record
    /// the outcome of a run that used its whole timeout.
    pub fn mark_running(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.instance.status = TaskStatus::Running;
        self.instance.started_at = Some(now);
        self.instance.retry_at = Some(add_duration(now, lease));
    }

    /// Back to `Idle` after a successful run of a recurring task.
    pub fn reschedule(&mut self, run_at: DateTime<Utc>, state: serde_json::Value) {
        self.instance.status = TaskStatus::Idle;
        self.instance.run_at = run_at;
        self.instance.state = state;
        self.instance.attempts = 0;
        self.instance.retry_at = None;
        self.instance.started_at = None;
        self.instance.owner_id = None;
    }

    /// Count a failed attempt.
    ///
    /// Returns the resulting status: `Failed` once `attempts` exceeds `max_attempts`,
    /// otherwise `Idle` with `run_at` pushed out by `delay`. The delay counts from the
    /// later of `now` and the current `run_at`, so a run claimed ahead of schedule never
    /// moves the task earlier.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        delay: Duration,
        max_attempts: u32,
    ) -> TaskStatus {
        self.instance.attempts = self.instance.attempts.saturating_add(1);
        self.instance.owner_id = None;
        self.instance.started_at = None;

        if self.instance.attempts > max_attempts {
            self.instance.status = TaskStatus::Failed;
            self.instance.retry_at = None;
        } else {
            let retry_at = add_duration(now.max(self.instance.run_at), delay);
            self.instance.status = TaskStatus::Idle;
            self.instance.retry_at = Some(retry_at);
            self.instance.run_at = retry_at;
        }
        self.instance.status
    }

    /// An active claim whose lease ran out (owner died or overran its timeout).
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.instance.status.is_active()
            && self.instance.retry_at.is_some_and(|retry_at| retry_at <= now)
    }

    /// Eligible to be claimed right now (ignoring capacity).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.instance.status {
            TaskStatus::Idle => self.instance.run_at <= now,
            TaskStatus::Claiming | TaskStatus::Running => self.is_stale(now),
            TaskStatus::Failed => false,
        }
    }
}

/// `at + d`, saturating at the maximum representable timestamp.
pub fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
