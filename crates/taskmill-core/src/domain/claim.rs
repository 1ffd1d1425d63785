//! Claim query semantics shared by every store backend.
//!
//! A backend snapshots the records, asks `ClaimRequest::plan` which ones to try,
//! then performs one conditional (CAS) write per candidate via `apply_claim`. Only the
//! writes the backend accepts count as claims.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{ConcreteTaskInstance, OwnerId, TaskId, TaskRecord, TaskStatus, TaskType};

/// Per-type limits the claim query honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Cluster-wide cap on `Claiming`/`Running` records of the type. `None` = unbounded.
    pub max_concurrency: Option<usize>,
    /// Failures tolerated before a record becomes `Failed`.
    pub max_attempts: u32,
    /// Lease granted on claim, before the run's own timeout takes over.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub owner_id: OwnerId,
    pub now: DateTime<Utc>,
    /// Only these types are claimable (the locally registered ones).
    pub policies: HashMap<TaskType, ClaimPolicy>,
    /// Ids to consider before anything else (`run_now`), regardless of `run_at` order.
    pub claim_ids_first: Vec<TaskId>,
    /// Free local workers; never claim more than this.
    pub max_tasks: usize,
}

/// What the query selected before any write.
#[derive(Debug, Clone, Default)]
pub struct ClaimPlan {
    pub candidates: Vec<TaskRecord>,
    /// Requested (`claim_ids_first`) records skipped because their type is saturated.
    pub out_of_capacity: Vec<ConcreteTaskInstance>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub candidates: usize,
    pub claimed: usize,
    /// CAS writes rejected because another writer got there first.
    pub conflicts: usize,
    /// Stale claims that ran out of attempts and were marked `Failed` instead.
    pub failed_stale: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimOutcome {
    pub claimed: Vec<TaskRecord>,
    pub out_of_capacity: Vec<ConcreteTaskInstance>,
    pub stats: ClaimStats,
}

/// Result of applying a claim to one candidate (before the CAS write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimTransition {
    Claimed,
    /// Stale claim past its attempt budget; write it as `Failed`, don't run it.
    FailedStale,
}

impl ClaimRequest {
    /// Select claim candidates from a snapshot of the store.
    ///
    /// - Eligible: registered type and `admits`.
    /// - Order: `claim_ids_first` (in request order), then `run_at`, then id.
    /// - Per type, at most `max_concurrency - active` are selected, where `active`
    ///   counts non-stale `Claiming`/`Running` records of that type.
    /// - At most `max_tasks` in total.
    pub fn plan<'a>(&self, records: impl IntoIterator<Item = &'a TaskRecord>) -> ClaimPlan {
        let mut active: HashMap<&TaskType, usize> = HashMap::new();
        let mut eligible: Vec<&TaskRecord> = Vec::new();

        for record in records {
            let task_type = &record.instance.task_type;
            if !self.policies.contains_key(task_type) {
                continue;
            }
            if record.instance.status.is_active() && !record.is_stale(self.now) {
                *active.entry(task_type).or_default() += 1;
            }
            if self.admits(record) {
                eligible.push(record);
            }
        }

        let priority = |id: &TaskId| {
            self.claim_ids_first
                .iter()
                .position(|requested| requested == id)
                .unwrap_or(usize::MAX)
        };
        eligible.sort_by(|a, b| {
            priority(&a.instance.id)
                .cmp(&priority(&b.instance.id))
                .then(a.instance.run_at.cmp(&b.instance.run_at))
                .then(a.instance.id.cmp(&b.instance.id))
        });

        let mut plan = ClaimPlan::default();
        for record in eligible {
            let requested = self.claim_ids_first.contains(&record.instance.id);
            if plan.candidates.len() >= self.max_tasks {
                if !requested {
                    break;
                }
                continue;
            }

            let task_type = &record.instance.task_type;
            let policy = self.policies[task_type];
            let in_use = active.get(task_type).copied().unwrap_or(0);
            let saturated = policy.max_concurrency.is_some_and(|max| in_use >= max);

            if saturated {
                if requested {
                    plan.out_of_capacity.push(record.instance.clone());
                }
                continue;
            }

            *active.entry(task_type).or_default() += 1;
            plan.candidates.push(record.clone());
        }
        plan
    }

    /// Claimable now, or an `Idle` record this request asked for by id (`run_now`
    /// runs a task ahead of its `run_at`).
    pub fn admits(&self, record: &TaskRecord) -> bool {
        record.is_claimable(self.now)
            || (record.instance.status == TaskStatus::Idle
                && self.claim_ids_first.contains(&record.instance.id))
    }

    pub fn policy(&self, task_type: &TaskType) -> Option<ClaimPolicy> {
        self.policies.get(task_type).copied()
    }
}

/// Transition a candidate in place. Stale claims count as a failed attempt.
pub fn apply_claim(
    record: &mut TaskRecord,
    owner: &OwnerId,
    now: DateTime<Utc>,
    policy: ClaimPolicy,
) -> ClaimTransition {
    if record.is_stale(now) {
        record.instance.attempts = record.instance.attempts.saturating_add(1);
        if record.instance.attempts > policy.max_attempts {
            record.instance.status = TaskStatus::Failed;
            record.instance.owner_id = None;
            record.instance.retry_at = None;
            return ClaimTransition::FailedStale;
        }
    }
    record.claim(owner.clone(), now, policy.timeout);
    ClaimTransition::Claimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskInstance, Version};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record(id: &str, task_type: &str, status: TaskStatus, run_at_offset: i64) -> TaskRecord {
        let mut instance = TaskInstance::new(TaskType::new(task_type))
            .with_run_at(now() + chrono::Duration::seconds(run_at_offset))
            .into_concrete(TaskId::new(id), now());
        instance.status = status;
        if status.is_active() {
            instance.retry_at = Some(now() + chrono::Duration::minutes(5));
        }
        TaskRecord::new(instance, Version::new(1, 1))
    }

    fn request(policies: &[(&str, Option<usize>)], first: &[&str], max_tasks: usize) -> ClaimRequest {
        ClaimRequest {
            owner_id: OwnerId::new("owner-a"),
            now: now(),
            policies: policies
                .iter()
                .map(|(t, max)| {
                    (
                        TaskType::new(*t),
                        ClaimPolicy {
                            max_concurrency: *max,
                            max_attempts: 3,
                            timeout: Duration::from_secs(300),
                        },
                    )
                })
                .collect(),
            claim_ids_first: first.iter().map(|id| TaskId::new(*id)).collect(),
            max_tasks,
        }
    }

    fn ids(plan: &ClaimPlan) -> Vec<&str> {
        plan.candidates.iter().map(|r| r.instance.id.as_str()).collect()
    }

    #[test]
    fn selects_due_idle_tasks_in_run_at_order() {
        let records = vec![
            record("late", "report", TaskStatus::Idle, -1),
            record("early", "report", TaskStatus::Idle, -10),
            record("future", "report", TaskStatus::Idle, 60),
            record("dead", "report", TaskStatus::Failed, -100),
        ];
        let plan = request(&[("report", None)], &[], 10).plan(&records);
        assert_eq!(ids(&plan), vec!["early", "late"]);
    }

    #[test]
    fn unregistered_types_are_ignored() {
        let records = vec![record("x", "unknown", TaskStatus::Idle, -1)];
        let plan = request(&[("report", None)], &[], 10).plan(&records);
        assert!(plan.candidates.is_empty());
    }

    #[test]
    fn requested_ids_jump_the_queue() {
        let records = vec![
            record("a", "report", TaskStatus::Idle, -10),
            record("b", "report", TaskStatus::Idle, -1),
        ];
        let plan = request(&[("report", None)], &["b"], 1).plan(&records);
        assert_eq!(ids(&plan), vec!["b"]);
    }

    #[test]
    fn requested_ids_ignore_run_at() {
        let records = vec![
            record("later", "report", TaskStatus::Idle, 3600),
            record("failed", "report", TaskStatus::Failed, -1),
        ];
        let plan = request(&[("report", None)], &["later", "failed"], 10).plan(&records);
        assert_eq!(ids(&plan), vec!["later"]);
    }

    #[test]
    fn never_exceeds_type_headroom() {
        let records = vec![
            record("running", "alert", TaskStatus::Running, -100),
            record("a", "alert", TaskStatus::Idle, -3),
            record("b", "alert", TaskStatus::Idle, -2),
            record("c", "alert", TaskStatus::Idle, -1),
        ];
        let plan = request(&[("alert", Some(2))], &[], 10).plan(&records);
        assert_eq!(ids(&plan), vec!["a"]);
    }

    #[test]
    fn saturated_requested_ids_are_reported() {
        let records = vec![
            record("running", "alert", TaskStatus::Running, -100),
            record("B", "alert", TaskStatus::Idle, 60),
        ];
        let plan = request(&[("alert", Some(1))], &["B"], 10).plan(&records);
        assert!(plan.candidates.is_empty());
        assert_eq!(plan.out_of_capacity.len(), 1);
        assert_eq!(plan.out_of_capacity[0].id.as_str(), "B");
    }

    #[test]
    fn stale_claims_do_not_hold_capacity_and_are_reclaimable() {
        let mut stale = record("stale", "alert", TaskStatus::Running, -100);
        stale.instance.retry_at = Some(now() - chrono::Duration::seconds(1));
        let records = vec![stale, record("a", "alert", TaskStatus::Idle, -1)];

        let plan = request(&[("alert", Some(1))], &[], 10).plan(&records);
        assert_eq!(ids(&plan), vec!["stale"]);
    }

    #[test]
    fn apply_claim_fails_stale_records_past_their_budget() {
        let mut stale = record("stale", "alert", TaskStatus::Running, -100);
        stale.instance.retry_at = Some(now() - chrono::Duration::seconds(1));
        stale.instance.attempts = 3;

        let policy = ClaimPolicy {
            max_concurrency: None,
            max_attempts: 3,
            timeout: Duration::from_secs(300),
        };
        let transition = apply_claim(&mut stale, &OwnerId::new("owner-b"), now(), policy);
        assert_eq!(transition, ClaimTransition::FailedStale);
        assert_eq!(stale.instance.status, TaskStatus::Failed);
    }
}
