//! EphemeralLifecycle - ストアを使わない即時実行レーン
//!
//! # 設計
//! - 受付は容量付き mpsc（`request_capacity`）。満杯なら即座に拒否（唯一のバックプレッシャー）
//! - drain ループがワーカー permit（`max_workers`）を取ってから 1 件取り出し、spawn して実行
//! - 失敗は終端。再試行も永続化もしない

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::ManagerContext;
use super::execution::execute;
use crate::domain::{
    ConcreteTaskInstance, ErroredTask, RanTask, RunRequestErr, RunnerError, TaskEvent,
};

#[derive(Clone)]
pub(crate) struct EphemeralLifecycle {
    ctx: Arc<ManagerContext>,
    tx: mpsc::Sender<ConcreteTaskInstance>,
    rx: Arc<Mutex<mpsc::Receiver<ConcreteTaskInstance>>>,
    capacity: usize,
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl EphemeralLifecycle {
    pub fn new(ctx: Arc<ManagerContext>, request_capacity: usize, max_workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(request_capacity.max(1));
        Self {
            ctx,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity: request_capacity.max(1),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Offer a task to the local queue. Emits `RunRequest(Ok)` or, when the queue is
    /// full, `RunRequest(Err)` and returns the rejection.
    pub fn attempt_to_run(&self, task: ConcreteTaskInstance) -> Result<(), RunRequestErr> {
        let id = task.id.clone();
        let now = self.ctx.now();
        match self.tx.try_send(task.clone()) {
            Ok(()) => {
                debug!(task_id = %id, "ephemeral task accepted");
                self.ctx.emit(TaskEvent::run_request(id, now, Ok(task)));
                Ok(())
            }
            Err(TrySendError::Full(task) | TrySendError::Closed(task)) => {
                warn!(task_id = %id, capacity = self.capacity, "ephemeral queue is full, rejecting task");
                let err = RunRequestErr {
                    capacity: self.capacity,
                    task,
                };
                self.ctx.emit(TaskEvent::run_request(id, now, Err(err.clone())));
                Err(err)
            }
        }
    }

    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            info!(owner = %lifecycle.ctx.owner_id, "ephemeral lifecycle started");
            let mut rx = lifecycle.rx.lock().await;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let permit = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    permit = Arc::clone(&lifecycle.workers).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let task = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };

                lifecycle
                    .ctx
                    .emit(TaskEvent::claim(task.id.clone(), lifecycle.ctx.now(), Ok(task.clone())));
                tokio::spawn(run_ephemeral(Arc::clone(&lifecycle.ctx), task, permit));
            }

            drop(rx);
            let all = u32::try_from(lifecycle.max_workers).unwrap_or(u32::MAX);
            let _ = lifecycle.workers.acquire_many(all).await;
            info!(owner = %lifecycle.ctx.owner_id, "ephemeral lifecycle stopped");
        })
    }
}

async fn run_ephemeral(ctx: Arc<ManagerContext>, task: ConcreteTaskInstance, _permit: OwnedSemaphorePermit) {
    let id = task.id.clone();
    let result = match run(&ctx, task).await {
        Ok(state) => Ok(RanTask {
            id: id.clone(),
            state,
        }),
        Err(err) => {
            debug!(task_id = %id, error = %err, "ephemeral task failed");
            Err(ErroredTask {
                id: id.clone(),
                error: err.to_string(),
            })
        }
    };
    ctx.emit(TaskEvent::run(id, ctx.now(), result));
}

async fn run(ctx: &ManagerContext, task: ConcreteTaskInstance) -> Result<serde_json::Value, RunnerError> {
    let Some(definition) = ctx.registry.get(&task.task_type) else {
        return Err(RunnerError::new(format!(
            "task type \"{}\" is not registered",
            task.task_type
        )));
    };
    let timeout = definition.effective_timeout(&ctx.defaults);
    let prepared = ctx
        .middleware
        .before_run(task)
        .await
        .map_err(|e| RunnerError::new(e.to_string()))?;
    let result = execute(&definition, prepared, timeout).await?;
    Ok(result.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing;
    use crate::domain::{EphemeralTask, TaskEventKind, TaskId};
    use crate::impls::InMemoryTaskStore;
    use crate::typed::TaskParams;
    use crate::typed::task::fixtures::Echo;
    use chrono::Utc;

    fn ephemeral(id: &str, ctx: &ManagerContext) -> ConcreteTaskInstance {
        let task: EphemeralTask = Echo {
            message: id.to_string(),
        }
        .to_ephemeral()
        .unwrap();
        task.into_concrete(TaskId::new(id), ctx.owner_id.clone(), Utc::now())
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let ctx = testing::context("owner-a", InMemoryTaskStore::new(), testing::registry());
        let mut rx = ctx.bus.subscribe();
        let lane = EphemeralLifecycle::new(Arc::clone(&ctx), 1, 1);

        lane.attempt_to_run(ephemeral("E1", &ctx)).unwrap();
        let err = lane.attempt_to_run(ephemeral("E2", &ctx)).unwrap_err();
        assert_eq!(err.capacity, 1);

        let event = testing::terminal_event(&mut rx, "E2").await;
        assert!(matches!(event.kind, TaskEventKind::RunRequest(Err(_))));
    }

    #[tokio::test]
    async fn accepted_tasks_run_without_touching_the_store() {
        let store = InMemoryTaskStore::new();
        let ctx = testing::context("owner-a", store.clone(), testing::registry());
        let mut rx = ctx.bus.subscribe();
        let lane = EphemeralLifecycle::new(Arc::clone(&ctx), 4, 2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = lane.spawn(shutdown_rx);

        lane.attempt_to_run(ephemeral("E1", &ctx)).unwrap();
        let event = testing::terminal_event(&mut rx, "E1").await;
        assert!(matches!(&event.kind, TaskEventKind::Run(Ok(ran)) if ran.state["echo"] == "E1"));
        assert_eq!(store.write_count(), 0);

        shutdown_tx.send_replace(true);
        join.await.unwrap();
    }
}
