//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - HashMap<TaskId, TaskRecord> を tokio の Mutex で保護
//! - 書き込みのたびに seq_no を進める（version = seq_no + primary_term）
//! - claim は「スナップショット → plan → 候補ごとに CAS」の順で行う
//!   （スナップショットと各 CAS は別々にロックを取るので、他の writer と競合しうる）
//! - clone した store は同じ状態を共有する（複数インスタンスの再現に使う）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::domain::{
    ClaimOutcome, ClaimRequest, ClaimTransition, StoreError, TaskId, TaskInstance, TaskRecord,
    Version, apply_claim,
};
use crate::ports::{TaskQuery, TaskStore};

const PRIMARY_TERM: u64 = 1;

#[derive(Debug, Default)]
struct InMemoryStoreState {
    records: HashMap<TaskId, TaskRecord>,
    seq_no: u64,
}

impl InMemoryStoreState {
    fn next_version(&mut self) -> Version {
        self.seq_no += 1;
        Version::new(self.seq_no, PRIMARY_TERM)
    }

    /// The conditional write every mutation goes through.
    fn compare_and_swap(&mut self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let id = &record.instance.id;
        match self.records.get(id) {
            None => Err(StoreError::NotFound { id: id.clone() }),
            Some(stored) if stored.version != record.version => {
                Err(StoreError::VersionConflict { id: id.clone() })
            }
            Some(_) => {
                let version = self.next_version();
                let stored = TaskRecord::new(record.instance.clone(), version);
                self.records.insert(id.clone(), stored.clone());
                Ok(stored)
            }
        }
    }
}

/// InMemoryTaskStore は単一プロセス内の TaskStore 実装
///
/// # 使用例
/// ```ignore
/// let store = InMemoryTaskStore::new();
/// let peer = store.clone(); // 同じレコードを見る別インスタンス
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    writes: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted writes so far (inserts, updates, deletes).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate an outage: while unavailable every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store is switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    async fn cas(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let stored = self.state.lock().await.compare_and_swap(record)?;
        self.count_write();
        Ok(stored)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn schedule(
        &self,
        instance: TaskInstance,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.records.contains_key(&id) {
            return Err(StoreError::VersionConflict { id });
        }

        let version = state.next_version();
        let record = TaskRecord::new(instance.into_concrete(id.clone(), now), version);
        state.records.insert(id, record.clone());
        drop(state);

        self.count_write();
        Ok(record)
    }

    async fn claim_available_tasks(
        &self,
        request: &ClaimRequest,
    ) -> Result<ClaimOutcome, StoreError> {
        self.ensure_available()?;
        // Planning and the claim writes share one lock so capacity is counted against
        // the records as they are written.
        let mut state = self.state.lock().await;
        let plan = request.plan(state.records.values());
        let mut outcome = ClaimOutcome {
            out_of_capacity: plan.out_of_capacity,
            ..ClaimOutcome::default()
        };
        outcome.stats.candidates = plan.candidates.len();

        for mut candidate in plan.candidates {
            let Some(policy) = request.policy(&candidate.instance.task_type) else {
                continue;
            };
            let transition = apply_claim(&mut candidate, &request.owner_id, request.now, policy);

            match state.compare_and_swap(&candidate) {
                Ok(stored) => match transition {
                    ClaimTransition::Claimed => {
                        self.count_write();
                        outcome.stats.claimed += 1;
                        outcome.claimed.push(stored);
                    }
                    ClaimTransition::FailedStale => {
                        self.count_write();
                        debug!(task_id = %stored.instance.id, "stale claim ran out of attempts");
                        outcome.stats.failed_stale += 1;
                    }
                },
                Err(StoreError::VersionConflict { id } | StoreError::NotFound { id }) => {
                    trace!(task_id = %id, "lost claim race");
                    outcome.stats.conflicts += 1;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    async fn update(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        self.ensure_available()?;
        self.cas(record).await
    }

    async fn remove(&self, id: &TaskId, version: Version) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.records.get(id) {
            None => return Err(StoreError::NotFound { id: id.clone() }),
            Some(stored) if stored.version != version => {
                return Err(StoreError::VersionConflict { id: id.clone() });
            }
            Some(_) => {
                state.records.remove(id);
            }
        }
        drop(state);

        self.count_write();
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.ensure_available()?;
        Ok(self.state.lock().await.records.get(id).cloned())
    }

    async fn fetch(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        self.ensure_available()?;
        let mut records: Vec<TaskRecord> = {
            let state = self.state.lock().await;
            state
                .records
                .values()
                .filter(|record| query.matches(&record.instance))
                .cloned()
                .collect()
        };
        records.sort_by(|a, b| {
            a.instance
                .run_at
                .cmp(&b.instance.run_at)
                .then(a.instance.id.cmp(&b.instance.id))
        });
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}
