//! TaskStore port - タスクレコードの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスクレコード（状態・params・state・run_at など）
//! - 楽観的並行制御（version による CAS 書き込み）
//! - claim クエリ（capacity を考慮した候補選択 + CAS で所有権を取得）
//!
//! # 設計原則
//! - 所有権の権威は version にある（ロックサービスは使わない）
//! - 書き込みは必ず読んだ version を添えて行い、変わっていたら VersionConflict
//! - capacity は claim 時に store から数える（インメモリのカウンタは持たない）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{
    ClaimOutcome, ClaimRequest, ConcreteTaskInstance, Decision, StoreError, TaskId,
    TaskInstance, TaskLifecycle, TaskRecord, TaskStatus, TaskType, Version,
};

/// Filter for `fetch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQuery {
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn by_type(task_type: TaskType) -> Self {
        Self {
            task_type: Some(task_type),
            ..Self::default()
        }
    }

    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, instance: &ConcreteTaskInstance) -> bool {
        self.task_type
            .as_ref()
            .is_none_or(|task_type| &instance.task_type == task_type)
            && self.status.is_none_or(|status| instance.status == status)
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub idle: usize,
    pub claiming: usize,
    pub running: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Idle => self.idle += 1,
            TaskStatus::Claiming => self.claiming += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.idle + self.claiming + self.running + self.failed
    }
}

/// TaskStore はタスクレコードの永続化境界
///
/// Implementations must make `update`/`remove` conditional on `version` and must
/// only return claims whose CAS write succeeded.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `Idle` record. An existing id is a `VersionConflict`.
    async fn schedule(
        &self,
        instance: TaskInstance,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError>;

    /// Run the claim query and CAS every selected candidate to `Claiming`.
    ///
    /// Lost races are dropped silently; the record stays eligible for later polls.
    async fn claim_available_tasks(
        &self,
        request: &ClaimRequest,
    ) -> Result<ClaimOutcome, StoreError>;

    /// CAS write of `record` against `record.version`. Returns the stored record with
    /// its new version.
    async fn update(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError>;

    /// CAS delete.
    async fn remove(&self, id: &TaskId, version: Version) -> Result<(), StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn fetch(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError>;

    /// Point read for diagnostics. Never used to decide a claim.
    async fn get_lifecycle(&self, id: &TaskId) -> Result<TaskLifecycle, StoreError> {
        Ok(match self.get(id).await? {
            Some(record) => TaskLifecycle::Status(record.instance.status),
            None => TaskLifecycle::NotFound,
        })
    }

    /// Apply a completion decision to a record this owner holds.
    ///
    /// Returns the updated record, or `None` when the record was removed or the write
    /// lost a race. A conflict here means someone else touched a claimed record; it is
    /// logged and dropped, never retried.
    async fn complete(
        &self,
        claimed: &TaskRecord,
        decision: Decision,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let id = &claimed.instance.id;

        let result = match decision {
            Decision::Remove => self.remove(id, claimed.version).await.map(|()| None),
            Decision::Reschedule { run_at, state } => {
                let mut next = claimed.clone();
                next.reschedule(run_at, state);
                self.update(&next).await.map(Some)
            }
            Decision::Retry { delay, error } => {
                let mut next = claimed.clone();
                let status = next.record_failure(now, delay, max_attempts);
                if status == TaskStatus::Failed {
                    warn!(
                        task_id = %id,
                        task_type = %next.instance.task_type,
                        attempts = next.instance.attempts,
                        error = %error,
                        "task exceeded its attempt limit and is marked failed"
                    );
                } else {
                    debug!(
                        task_id = %id,
                        attempts = next.instance.attempts,
                        retry_at = ?next.instance.retry_at,
                        "task failed, retry scheduled"
                    );
                }
                self.update(&next).await.map(Some)
            }
        };

        match result {
            Err(StoreError::VersionConflict { .. }) => {
                warn!(task_id = %id, "task was modified while claimed, dropping completion");
                Ok(None)
            }
            other => other,
        }
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        let mut counts = TaskCounts::default();
        for record in self.fetch(&TaskQuery::default()).await? {
            counts.record(record.instance.status);
        }
        Ok(counts)
    }
}
