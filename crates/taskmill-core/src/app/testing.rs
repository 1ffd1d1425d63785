//! Shared fixtures for lifecycle and facade tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::bus::EventBus;
use super::context::ManagerContext;
use super::middleware::MiddlewareChain;
use crate::domain::{DefaultDecider, OwnerId, RunResult, RunnerError, TaskEvent};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, SystemClock, UlidGenerator};
use crate::typed::handler::fixtures::{CounterHandler, EchoHandler};
use crate::typed::task::fixtures::{Counter, Echo};
use crate::typed::{Handler, RunContext, TaskDefaults, TaskDefinition, TaskParams, TaskTypeRegistry};

/// Always fails with "boom".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail;

impl TaskParams for Fail {
    const TYPE: &'static str = "test.fail";
}

pub struct FailHandler;

#[async_trait]
impl Handler<Fail> for FailHandler {
    async fn run(&self, _params: Fail, _ctx: RunContext) -> Result<RunResult, RunnerError> {
        Err(RunnerError::new("boom"))
    }
}

/// Blocks until its handler's gate is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate;

impl TaskParams for Gate {
    const TYPE: &'static str = "test.gate";
}

#[derive(Clone)]
pub struct GateHandler {
    open: Arc<watch::Sender<bool>>,
}

impl GateHandler {
    pub fn closed() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { open: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl Handler<Gate> for GateHandler {
    async fn run(&self, _params: Gate, ctx: RunContext) -> Result<RunResult, RunnerError> {
        let mut rx = self.open.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|e| RunnerError::new(e.to_string()))?;
        Ok(RunResult::with_state(ctx.state))
    }
}

pub fn registry() -> TaskTypeRegistry {
    let mut registry = TaskTypeRegistry::new();
    registry.register_typed::<Echo, _>(EchoHandler).unwrap();
    registry.register_typed::<Counter, _>(CounterHandler).unwrap();
    registry.register_typed::<Fail, _>(FailHandler).unwrap();
    registry
}

pub fn registry_with(definition: TaskDefinition) -> TaskTypeRegistry {
    let mut registry = registry();
    registry.register(definition).unwrap();
    registry
}

pub fn context(
    owner: &str,
    store: InMemoryTaskStore,
    registry: TaskTypeRegistry,
) -> Arc<ManagerContext> {
    context_with_clock(owner, store, registry, SystemClock)
}

pub fn context_with_clock(
    owner: &str,
    store: InMemoryTaskStore,
    registry: TaskTypeRegistry,
    clock: impl Clock + 'static,
) -> Arc<ManagerContext> {
    Arc::new(ManagerContext {
        owner_id: OwnerId::new(owner),
        store: Arc::new(store),
        registry: Arc::new(registry),
        middleware: MiddlewareChain::new(),
        bus: EventBus::new(256),
        clock: Arc::new(clock),
        ids: Arc::new(UlidGenerator::new(SystemClock)),
        decider: Arc::new(DefaultDecider),
        defaults: TaskDefaults::default(),
    })
}

/// Next terminal event for `id`, failing the test after a few seconds.
pub async fn terminal_event(
    rx: &mut broadcast::Receiver<Arc<TaskEvent>>,
    id: &str,
) -> Arc<TaskEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.id.as_str() == id && event.is_terminal() {
                return event;
            }
        }
    })
    .await
    .unwrap()
}
