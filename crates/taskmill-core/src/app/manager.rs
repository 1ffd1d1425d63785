//! TaskManager - lifecycle の起動と停止
//!
//! `start()` で polling / ephemeral のループを spawn し、`TaskManagerHandle` を返します。
//! 停止は watch チャネルで通知し、各ループが実行中のタスクを待ってから終わります。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::context::ManagerContext;
use super::ephemeral::EphemeralLifecycle;
use super::polling::PollingLifecycle;
use super::scheduling::TaskScheduling;
use crate::config::TaskManagerConfig;
use crate::domain::OwnerId;

pub struct TaskManager {
    ctx: Arc<ManagerContext>,
    polling: PollingLifecycle,
    ephemeral: Option<EphemeralLifecycle>,
    config: TaskManagerConfig,
}

impl TaskManager {
    pub(crate) fn new(ctx: Arc<ManagerContext>, config: TaskManagerConfig) -> Self {
        let polling = PollingLifecycle::new(
            Arc::clone(&ctx),
            config.max_workers,
            config.poll_interval(),
        );
        let ephemeral = config.ephemeral.enabled.then(|| {
            EphemeralLifecycle::new(
                Arc::clone(&ctx),
                config.ephemeral.request_capacity,
                config.ephemeral.max_workers,
            )
        });
        Self {
            ctx,
            polling,
            ephemeral,
            config,
        }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.ctx.owner_id
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// The facade, usable before `start` (tasks can be scheduled ahead of the loops).
    pub fn scheduling(&self) -> TaskScheduling {
        TaskScheduling::new(
            Arc::clone(&self.ctx),
            self.polling.clone(),
            self.ephemeral.clone(),
        )
    }

    pub fn start(self) -> TaskManagerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = vec![self.polling.spawn(shutdown_rx.clone())];
        if let Some(lane) = &self.ephemeral {
            joins.push(lane.spawn(shutdown_rx));
        }

        info!(
            owner = %self.ctx.owner_id,
            poll_interval_ms = self.config.poll_interval_ms,
            max_workers = self.config.max_workers,
            ephemeral = self.ephemeral.is_some(),
            task_types = self.ctx.registry.registered_types().len(),
            "task manager started"
        );

        TaskManagerHandle {
            scheduling: self.scheduling(),
            owner_id: self.ctx.owner_id.clone(),
            shutdown_tx,
            joins,
        }
    }
}

/// Running manager. Dropping the handle without `shutdown_and_join` leaves the loops
/// running until the runtime stops.
pub struct TaskManagerHandle {
    scheduling: TaskScheduling,
    owner_id: OwnerId,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl TaskManagerHandle {
    pub fn scheduling(&self) -> TaskScheduling {
        self.scheduling.clone()
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    /// Stop claiming, wait for in-flight runs to finish, then return.
    pub async fn shutdown_and_join(self) {
        info!(owner = %self.owner_id, "shutting down task manager");
        self.shutdown_tx.send_replace(true);
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(owner = %self.owner_id, error = %err, "lifecycle loop ended abnormally");
            }
        }
        info!(owner = %self.owner_id, "task manager stopped");
    }
}
