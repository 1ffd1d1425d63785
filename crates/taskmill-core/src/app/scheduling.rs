//! TaskScheduling - 呼び出し側に見える唯一の API
//!
//! # 責務
//! - schedule / ensure_scheduled: middleware を通してストアに書く（実行は待たない）
//! - run_now / ephemeral_run_now: lifecycle に実行を依頼し、イベントストリームで結果を待つ
//!
//! # 結果の相関
//! 依頼する前に購読しておき、同じ id の終端イベントが来た時点で確定します。
//! - Claim(Err)       → OutOfCapacity、または get_lifecycle による診断
//! - Run(Ok)          → `RunNowResult`
//! - Run(Err)         → Runner エラー
//! - RunRequest(Err)  → EphemeralQueueFull
//!
//! future を drop すると購読も外れます。実行中のタスク自体は止まりません。

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::context::ManagerContext;
use super::ephemeral::EphemeralLifecycle;
use super::polling::PollingLifecycle;
use crate::domain::{
    ClaimErrorType, ClaimTaskErr, ConcreteTaskInstance, EphemeralTask, RunNowResult, TaskEvent,
    TaskEventKind, TaskId, TaskInstance, TaskLifecycle, TaskManagerError, TaskStatus, TaskType,
};
use crate::ports::{TaskCounts, TaskQuery};

#[derive(Clone)]
pub struct TaskScheduling {
    ctx: Arc<ManagerContext>,
    polling: PollingLifecycle,
    ephemeral: Option<EphemeralLifecycle>,
}

impl TaskScheduling {
    pub(crate) fn new(
        ctx: Arc<ManagerContext>,
        polling: PollingLifecycle,
        ephemeral: Option<EphemeralLifecycle>,
    ) -> Self {
        Self {
            ctx,
            polling,
            ephemeral,
        }
    }

    /// Store a new task. Returns as soon as the record is written.
    pub async fn schedule(
        &self,
        instance: TaskInstance,
    ) -> Result<ConcreteTaskInstance, TaskManagerError> {
        let instance = self
            .ctx
            .middleware
            .before_save(instance)
            .await
            .map_err(|e| TaskManagerError::Middleware(e.to_string()))?;
        self.ensure_registered(&instance.task_type)?;

        let id = instance
            .id
            .clone()
            .unwrap_or_else(|| self.ctx.ids.generate_task_id());
        let record = self.ctx.store.schedule(instance, id, self.ctx.now()).await?;

        info!(
            task_id = %record.instance.id,
            task_type = %record.instance.task_type,
            run_at = %record.instance.run_at,
            "task scheduled"
        );
        Ok(record.instance)
    }

    /// Idempotent create: if a task with this id already exists, the stored task is
    /// returned instead of an error.
    pub async fn ensure_scheduled(
        &self,
        instance: TaskInstance,
    ) -> Result<ConcreteTaskInstance, TaskManagerError> {
        let Some(id) = instance.id.clone() else {
            return Err(TaskManagerError::Validation(
                "ensure_scheduled requires a task id".to_string(),
            ));
        };

        match self.schedule(instance.clone()).await {
            Err(err) if err.is_version_conflict() => {
                debug!(task_id = %id, "task already scheduled");
                match self.ctx.store.get(&id).await? {
                    Some(existing) => Ok(existing.instance),
                    None => Ok(instance.into_concrete(id, self.ctx.now())),
                }
            }
            other => other,
        }
    }

    /// Ask the polling lifecycle to claim `id` on its next cycle and wait for the result.
    pub async fn run_now(&self, id: impl Into<TaskId>) -> Result<RunNowResult, TaskManagerError> {
        let id = id.into();
        let mut events = self.ctx.bus.subscribe();
        self.polling.attempt_to_run(id.clone());
        self.await_result(&id, &mut events).await
    }

    /// Run tasks on this instance without storing them. Every task settles on its own;
    /// one failure does not affect the others.
    pub async fn ephemeral_run_now(
        &self,
        tasks: Vec<EphemeralTask>,
    ) -> Vec<Result<RunNowResult, TaskManagerError>> {
        join_all(tasks.into_iter().map(|task| self.ephemeral_run_one(task))).await
    }

    pub async fn get(
        &self,
        id: &TaskId,
    ) -> Result<Option<ConcreteTaskInstance>, TaskManagerError> {
        Ok(self.ctx.store.get(id).await?.map(|record| record.instance))
    }

    pub async fn fetch(
        &self,
        query: &TaskQuery,
    ) -> Result<Vec<ConcreteTaskInstance>, TaskManagerError> {
        let records = self.ctx.store.fetch(query).await?;
        Ok(records.into_iter().map(|record| record.instance).collect())
    }

    /// Delete a task by id, against the version currently stored.
    pub async fn remove(&self, id: &TaskId) -> Result<(), TaskManagerError> {
        let Some(record) = self.ctx.store.get(id).await? else {
            return Err(TaskManagerError::NotFound { id: id.clone() });
        };
        self.ctx.store.remove(id, record.version).await?;
        info!(task_id = %id, "task removed");
        Ok(())
    }

    pub async fn counts(&self) -> Result<TaskCounts, TaskManagerError> {
        Ok(self.ctx.store.counts().await?)
    }

    /// Raw lifecycle event stream of this instance.
    pub fn events(&self) -> broadcast::Receiver<Arc<TaskEvent>> {
        self.ctx.bus.subscribe()
    }

    fn ensure_registered(&self, task_type: &TaskType) -> Result<(), TaskManagerError> {
        if self.ctx.registry.contains(task_type) {
            Ok(())
        } else {
            Err(TaskManagerError::UnknownTaskType(task_type.clone()))
        }
    }

    async fn ephemeral_run_one(
        &self,
        task: EphemeralTask,
    ) -> Result<RunNowResult, TaskManagerError> {
        let Some(lane) = &self.ephemeral else {
            return Err(TaskManagerError::EphemeralDisabled);
        };

        let wrapped = TaskInstance::new(task.task_type)
            .with_params(task.params)
            .with_state(task.state);
        let prepared = self
            .ctx
            .middleware
            .before_save(wrapped)
            .await
            .map_err(|e| TaskManagerError::Middleware(e.to_string()))?;
        self.ensure_registered(&prepared.task_type)?;

        let id = self.ctx.ids.generate_task_id();
        let concrete = EphemeralTask {
            task_type: prepared.task_type,
            params: prepared.params,
            state: prepared.state,
        }
        .into_concrete(id.clone(), self.ctx.owner_id.clone(), self.ctx.now());

        let mut events = self.ctx.bus.subscribe();
        if let Err(rejected) = lane.attempt_to_run(concrete) {
            return Err(TaskManagerError::EphemeralQueueFull {
                id,
                capacity: rejected.capacity,
            });
        }
        self.await_result(&id, &mut events).await
    }

    async fn await_result(
        &self,
        id: &TaskId,
        events: &mut broadcast::Receiver<Arc<TaskEvent>>,
    ) -> Result<RunNowResult, TaskManagerError> {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(task_id = %id, skipped, "event subscriber lagged behind");
                    continue;
                }
                Err(RecvError::Closed) => {
                    return Err(TaskManagerError::EventStreamClosed { id: id.clone() });
                }
            };
            if &event.id != id {
                continue;
            }

            match &event.kind {
                TaskEventKind::Run(Ok(ran)) => return Ok(ran.clone().into()),
                TaskEventKind::Run(Err(errored)) => {
                    return Err(TaskManagerError::Runner {
                        id: id.clone(),
                        error: errored.error.clone(),
                    });
                }
                TaskEventKind::RunRequest(Err(rejected)) => {
                    return Err(TaskManagerError::EphemeralQueueFull {
                        id: id.clone(),
                        capacity: rejected.capacity,
                    });
                }
                TaskEventKind::Claim(Err(err)) => return Err(self.explain_claim_failure(id, err).await),
                TaskEventKind::Claim(Ok(_)) | TaskEventKind::RunRequest(Ok(_)) => {}
            }
        }
    }

    async fn explain_claim_failure(&self, id: &TaskId, err: &ClaimTaskErr) -> TaskManagerError {
        if err.error_type == ClaimErrorType::OutOfCapacity {
            if let Some(task) = &err.task {
                let (title, max_concurrency) = match self.ctx.registry.get(&task.task_type) {
                    Some(def) => (def.title.clone(), def.max_concurrency.unwrap_or_default()),
                    None => (task.task_type.to_string(), 0),
                };
                return TaskManagerError::OutOfCapacity {
                    id: id.clone(),
                    title,
                    max_concurrency,
                };
            }
        }

        match self.ctx.store.get_lifecycle(id).await {
            Ok(TaskLifecycle::NotFound) => TaskManagerError::NotFound { id: id.clone() },
            Ok(TaskLifecycle::Status(TaskStatus::Running | TaskStatus::Claiming)) => {
                TaskManagerError::AlreadyRunning { id: id.clone() }
            }
            Ok(lifecycle) => TaskManagerError::UnknownReason {
                id: id.clone(),
                lifecycle,
            },
            Err(store_err) => TaskManagerError::Store(store_err),
        }
    }
}

impl std::fmt::Debug for TaskScheduling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduling")
            .field("owner_id", &self.ctx.owner_id)
            .field("ephemeral", &self.ephemeral.is_some())
            .finish()
    }
}
