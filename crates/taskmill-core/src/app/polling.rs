//! PollingLifecycle - 永続タスクの claim → run → complete ループ
//!
//! # 1 サイクルの流れ
//! 1. `attempt_to_run` で積まれた id を空きワーカー数まで取り出す
//! 2. store の claim クエリ（要求 id 優先、capacity 考慮、CAS）
//! 3. claim 結果をすぐにイベントとして publish（Claim(Ok) / Claim(Err)）
//! 4. claim したタスクごとにワーカー permit を持って spawn し、
//!    mark_running → before_run → runner（timeout 付き）→ Decider → complete → Run イベント
//!
//! ループは実行中タスクの完了を待たずに次の tick に進みます。
//! claim クエリの失敗は warn ログを出して次の tick で再試行（要求 id は積み直す）。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::context::ManagerContext;
use super::execution::execute;
use crate::domain::{
    ClaimErrorType, ClaimOutcome, ClaimRequest, ClaimTaskErr, ErroredTask, RanTask, RunnerError,
    TaskEvent, TaskId, TaskRecord,
};

#[derive(Clone)]
pub(crate) struct PollingLifecycle {
    ctx: Arc<ManagerContext>,
    requested: Arc<Mutex<VecDeque<TaskId>>>,
    nudge: Arc<Notify>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    poll_interval: Duration,
}

impl PollingLifecycle {
    pub fn new(ctx: Arc<ManagerContext>, max_workers: usize, poll_interval: Duration) -> Self {
        Self {
            ctx,
            requested: Arc::new(Mutex::new(VecDeque::new())),
            nudge: Arc::new(Notify::new()),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            poll_interval,
        }
    }

    /// Ask the next cycle to claim `id` ahead of everything else, and wake the loop.
    pub fn attempt_to_run(&self, id: TaskId) {
        self.requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(id);
        self.nudge.notify_one();
    }

    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lifecycle.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(owner = %lifecycle.ctx.owner_id, "polling lifecycle started");

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                    _ = lifecycle.nudge.notified() => {}
                }

                lifecycle.poll_once().await;
            }

            lifecycle.drain().await;
            info!(owner = %lifecycle.ctx.owner_id, "polling lifecycle stopped");
        })
    }

    /// One claim cycle. Returns how many tasks were claimed (and spawned).
    pub async fn poll_once(&self) -> usize {
        let free = self.workers.available_permits();
        if free == 0 {
            debug!(owner = %self.ctx.owner_id, "all workers busy, skipping claim");
            return 0;
        }

        let requested = self.take_requested(free);
        let request = ClaimRequest {
            owner_id: self.ctx.owner_id.clone(),
            now: self.ctx.now(),
            policies: self.ctx.registry.claim_policies(&self.ctx.defaults),
            claim_ids_first: requested.clone(),
            max_tasks: free,
        };

        let outcome = match self.ctx.store.claim_available_tasks(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    owner = %self.ctx.owner_id,
                    error = %err,
                    "claim query failed, retrying next cycle"
                );
                self.requeue(requested);
                return 0;
            }
        };

        if outcome.stats.candidates > 0 {
            debug!(
                owner = %self.ctx.owner_id,
                candidates = outcome.stats.candidates,
                claimed = outcome.stats.claimed,
                conflicts = outcome.stats.conflicts,
                failed_stale = outcome.stats.failed_stale,
                "claim cycle"
            );
        }
        self.publish_claims(&requested, &outcome);

        let claimed = outcome.claimed.len();
        for record in outcome.claimed {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                error!(task_id = %record.instance.id, "worker pool closed, claimed task left to expire");
                continue;
            };
            tokio::spawn(run_claimed(
                Arc::clone(&self.ctx),
                record,
                self.poll_interval,
                permit,
            ));
        }
        claimed
    }

    /// Wait for in-flight runs to finish.
    pub async fn drain(&self) {
        let all = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        let _ = self.workers.acquire_many(all).await;
    }

    fn take_requested(&self, limit: usize) -> Vec<TaskId> {
        let mut queue = self.requested.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<TaskId> = Vec::new();
        while ids.len() < limit {
            let Some(id) = queue.pop_front() else {
                break;
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    fn requeue(&self, ids: Vec<TaskId>) {
        let mut queue = self.requested.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids.into_iter().rev() {
            queue.push_front(id);
        }
    }

    fn publish_claims(&self, requested: &[TaskId], outcome: &ClaimOutcome) {
        let now = self.ctx.now();

        for record in &outcome.claimed {
            let instance = record.instance.clone();
            self.ctx
                .emit(TaskEvent::claim(instance.id.clone(), now, Ok(instance)));
        }

        for task in &outcome.out_of_capacity {
            debug!(task_id = %task.id, task_type = %task.task_type, "requested task is out of capacity");
            let err = ClaimTaskErr {
                error_type: ClaimErrorType::OutOfCapacity,
                task: Some(task.clone()),
            };
            self.ctx.emit(TaskEvent::claim(task.id.clone(), now, Err(err)));
        }

        for id in requested {
            let settled = outcome.claimed.iter().any(|r| &r.instance.id == id)
                || outcome.out_of_capacity.iter().any(|t| &t.id == id);
            if !settled {
                let err = ClaimTaskErr {
                    error_type: ClaimErrorType::Unclaimable,
                    task: None,
                };
                self.ctx.emit(TaskEvent::claim(id.clone(), now, Err(err)));
            }
        }
    }
}

async fn run_claimed(
    ctx: Arc<ManagerContext>,
    claimed: TaskRecord,
    lease_grace: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let id = claimed.instance.id.clone();
    let result = match run_and_complete(&ctx, claimed, lease_grace).await {
        Ok(state) => Ok(RanTask {
            id: id.clone(),
            state,
        }),
        Err(err) => Err(ErroredTask {
            id: id.clone(),
            error: err.to_string(),
        }),
    };
    ctx.emit(TaskEvent::run(id, ctx.now(), result));
}

async fn run_and_complete(
    ctx: &ManagerContext,
    claimed: TaskRecord,
    lease_grace: Duration,
) -> Result<serde_json::Value, RunnerError> {
    let id = claimed.instance.id.clone();
    let task_type = claimed.instance.task_type.clone();
    let Some(definition) = ctx.registry.get(&task_type) else {
        error!(task_id = %id, task_type = %task_type, "claimed a task of an unregistered type");
        return Err(RunnerError::new(format!(
            "task type \"{task_type}\" is not registered"
        )));
    };

    let timeout = definition.effective_timeout(&ctx.defaults);
    let mut running = claimed;
    // The lease outlives the timeout by one poll interval so completion is written
    // before another poller may treat the run as stale.
    running.mark_running(ctx.now(), timeout.saturating_add(lease_grace));
    let running = match ctx.store.update(&running).await {
        Ok(stored) => stored,
        Err(err) => {
            warn!(task_id = %id, error = %err, "could not mark task as running");
            return Err(RunnerError::new(format!(
                "failed to mark task as running: {err}"
            )));
        }
    };

    debug!(task_id = %id, task_type = %task_type, owner = %ctx.owner_id, "running task");
    let outcome = match ctx.middleware.before_run(running.instance.clone()).await {
        Ok(prepared) => execute(&definition, prepared, timeout).await,
        Err(err) => Err(RunnerError::new(err.to_string())),
    };

    let now = ctx.now();
    let retry = definition.effective_retry(&ctx.defaults);
    let decision = ctx.decider.decide(&running.instance, &outcome, retry, now);
    let max_attempts = definition.effective_max_attempts(&ctx.defaults);
    if let Err(err) = ctx.store.complete(&running, decision, now, max_attempts).await {
        warn!(task_id = %id, error = %err, "failed to record task completion");
    }

    outcome.map(|result| result.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{self, Fail, Gate, GateHandler};
    use crate::domain::{IntervalSchedule, TaskEventKind, TaskInstance, TaskStatus};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ManualClock, TaskStore};
    use crate::typed::{TaskDefinition, TaskParams};
    use crate::typed::task::fixtures::{Counter, Echo};
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::broadcast;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    async fn schedule(store: &InMemoryTaskStore, id: &str, instance: TaskInstance) {
        store
            .schedule(instance, TaskId::new(id), chrono::Utc::now())
            .await
            .unwrap();
    }

    fn drain_events(rx: &mut broadcast::Receiver<Arc<TaskEvent>>) -> Vec<Arc<TaskEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn one_off_task_is_claimed_run_and_removed() {
        let store = InMemoryTaskStore::new();
        let ctx = testing::context("owner-a", store.clone(), testing::registry());
        let mut rx = ctx.bus.subscribe();
        let polling = PollingLifecycle::new(Arc::clone(&ctx), 4, Duration::from_secs(60));

        let echo = Echo {
            message: "hi".to_string(),
        };
        schedule(&store, "A", echo.to_instance().unwrap()).await;

        assert_eq!(polling.poll_once().await, 1);
        let ran = testing::terminal_event(&mut rx, "A").await;
        assert!(matches!(&ran.kind, TaskEventKind::Run(Ok(task)) if task.state["echo"] == "hi"));
        assert!(store.get(&TaskId::new("A")).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_pollers_claim_a_requested_task_once() {
        let store = InMemoryTaskStore::new();
        let gate = GateHandler::closed();
        let registry = testing::registry_with(TaskDefinition::typed::<Gate, _>(gate.clone()));
        schedule(&store, "A", Gate.to_instance().unwrap()).await;

        let a = testing::context("owner-a", store.clone(), registry.clone());
        let b = testing::context("owner-b", store.clone(), registry);
        let mut rx_a = a.bus.subscribe();
        let mut rx_b = b.bus.subscribe();
        let poller_a = PollingLifecycle::new(a, 4, Duration::from_secs(60));
        let poller_b = PollingLifecycle::new(b, 4, Duration::from_secs(60));

        poller_a.attempt_to_run(TaskId::new("A"));
        poller_b.attempt_to_run(TaskId::new("A"));
        let (claimed_a, claimed_b) = tokio::join!(poller_a.poll_once(), poller_b.poll_once());
        assert_eq!(claimed_a + claimed_b, 1);

        let claim_oks = drain_events(&mut rx_a)
            .into_iter()
            .chain(drain_events(&mut rx_b))
            .filter(|e| matches!(e.kind, TaskEventKind::Claim(Ok(_))))
            .count();
        assert_eq!(claim_oks, 1);
        gate.open();
    }

    #[tokio::test]
    async fn saturated_requested_task_reports_out_of_capacity() {
        let store = InMemoryTaskStore::new();
        let gate = GateHandler::closed();
        let registry = testing::registry_with(
            TaskDefinition::typed::<Gate, _>(gate.clone())
                .with_title("Gate")
                .with_max_concurrency(1),
        );
        schedule(&store, "running", Gate.to_instance().unwrap()).await;
        let ctx = testing::context("owner-a", store.clone(), registry);
        let polling = PollingLifecycle::new(Arc::clone(&ctx), 4, Duration::from_secs(60));
        assert_eq!(polling.poll_once().await, 1);

        let later = chrono::Utc::now() + chrono::Duration::hours(1);
        schedule(&store, "B", Gate.to_instance().unwrap().with_run_at(later)).await;
        let mut rx = ctx.bus.subscribe();
        polling.attempt_to_run(TaskId::new("B"));
        assert_eq!(polling.poll_once().await, 0);

        let event = testing::terminal_event(&mut rx, "B").await;
        match &event.kind {
            TaskEventKind::Claim(Err(err)) => {
                assert_eq!(err.error_type, ClaimErrorType::OutOfCapacity);
                assert_eq!(err.task.as_ref().map(|t| t.id.as_str()), Some("B"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        gate.open();
        polling.drain().await;
    }

    #[tokio::test]
    async fn failures_are_recorded_with_backoff() {
        let store = InMemoryTaskStore::new();
        let ctx = testing::context("owner-a", store.clone(), testing::registry());
        let mut rx = ctx.bus.subscribe();
        let polling = PollingLifecycle::new(Arc::clone(&ctx), 4, Duration::from_secs(60));
        schedule(&store, "D", Fail.to_instance().unwrap()).await;

        polling.poll_once().await;
        let event = testing::terminal_event(&mut rx, "D").await;
        assert!(matches!(&event.kind, TaskEventKind::Run(Err(e)) if e.error == "boom"));

        let record = store.get(&TaskId::new("D")).await.unwrap().unwrap();
        assert_eq!(record.instance.status, TaskStatus::Idle);
        assert_eq!(record.instance.attempts, 1);
        assert!(record.instance.run_at > record.instance.scheduled_at);
    }

    #[tokio::test]
    async fn recurring_task_is_rescheduled_one_interval_after_its_run() {
        let store = InMemoryTaskStore::new();
        let ctx = testing::context_with_clock(
            "owner-a",
            store.clone(),
            testing::registry(),
            ManualClock::new(t0()),
        );
        let mut rx = ctx.bus.subscribe();
        let polling = PollingLifecycle::new(Arc::clone(&ctx), 4, Duration::from_secs(60));
        let task = Counter { step: 1 }
            .to_instance()
            .unwrap()
            .with_state(serde_json::json!({"count": 41}))
            .with_schedule(IntervalSchedule::every(Duration::from_secs(600)));
        store.schedule(task, TaskId::new("R"), t0()).await.unwrap();

        assert_eq!(polling.poll_once().await, 1);
        let event = testing::terminal_event(&mut rx, "R").await;
        assert!(matches!(&event.kind, TaskEventKind::Run(Ok(task)) if task.state["count"] == 42));

        let record = store.get(&TaskId::new("R")).await.unwrap().unwrap();
        assert_eq!(record.instance.status, TaskStatus::Idle);
        assert_eq!(record.instance.run_at, t0() + chrono::Duration::seconds(600));
        assert_eq!(record.instance.state["count"], 42);
        assert_eq!(record.instance.attempts, 0);
        assert!(record.instance.owner_id.is_none());
        assert!(record.instance.started_at.is_none());
        assert!(record.instance.retry_at.is_none());

        assert_eq!(polling.poll_once().await, 0);
    }

    #[tokio::test]
    async fn running_lease_outlasts_the_run_timeout() {
        let store = InMemoryTaskStore::new();
        let gate = GateHandler::closed();
        let registry = testing::registry_with(
            TaskDefinition::typed::<Gate, _>(gate.clone()).with_timeout(Duration::from_secs(10)),
        );
        store
            .schedule(Gate.to_instance().unwrap(), TaskId::new("G"), t0())
            .await
            .unwrap();
        let ctx =
            testing::context_with_clock("owner-a", store.clone(), registry, ManualClock::new(t0()));
        let polling = PollingLifecycle::new(ctx, 4, Duration::from_secs(60));
        assert_eq!(polling.poll_once().await, 1);

        let running = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = store.get(&TaskId::new("G")).await.unwrap().unwrap();
                if record.instance.status == TaskStatus::Running {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(running.instance.started_at, Some(t0()));
        assert_eq!(running.instance.retry_at, Some(t0() + chrono::Duration::seconds(70)));
        assert!(!running.is_claimable(t0() + chrono::Duration::seconds(10)));
        assert!(running.is_claimable(t0() + chrono::Duration::seconds(70)));

        gate.open();
        polling.drain().await;
    }

    #[tokio::test]
    async fn store_outage_requeues_requested_ids_without_events() {
        let store = InMemoryTaskStore::new();
        let ctx = testing::context("owner-a", store.clone(), testing::registry());
        let mut rx = ctx.bus.subscribe();
        let polling = PollingLifecycle::new(Arc::clone(&ctx), 4, Duration::from_secs(60));
        let echo = Echo {
            message: "later".to_string(),
        };
        schedule(&store, "A", echo.to_instance().unwrap()).await;

        store.set_available(false);
        polling.attempt_to_run(TaskId::new("A"));
        assert_eq!(polling.poll_once().await, 0);
        assert!(drain_events(&mut rx).is_empty());

        store.set_available(true);
        assert_eq!(polling.poll_once().await, 1);
        let event = testing::terminal_event(&mut rx, "A").await;
        assert!(matches!(event.kind, TaskEventKind::Run(Ok(_))));
    }

    #[tokio::test]
    async fn never_claims_more_than_free_workers() {
        let store = InMemoryTaskStore::new();
        let gate = GateHandler::closed();
        let registry = testing::registry_with(TaskDefinition::typed::<Gate, _>(gate.clone()));
        for n in 0..3 {
            schedule(&store, &format!("g{n}"), Gate.to_instance().unwrap()).await;
        }
        let ctx = testing::context("owner-a", store.clone(), registry);
        let polling = PollingLifecycle::new(ctx, 2, Duration::from_secs(60));

        assert_eq!(polling.poll_once().await, 2);
        assert_eq!(polling.poll_once().await, 0);

        gate.open();
        polling.drain().await;
        assert_eq!(store.counts().await.unwrap().idle, 1);
    }
}
