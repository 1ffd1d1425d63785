//! TaskManagerBuilder - TaskManager の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: config の検証と期待 task_type の登録チェック
//! - ports の差し替え（store / clock / id generator / decider）

use std::sync::Arc;

use super::bus::EventBus;
use super::context::ManagerContext;
use super::manager::TaskManager;
use super::middleware::{Middleware, MiddlewareChain};
use crate::config::{ConfigError, TaskManagerConfig};
use crate::domain::{Decider, DefaultDecider, OwnerId, TaskType};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{Handler, RegistryError, TaskDefinition, TaskParams, TaskTypeRegistry};

/// TaskManagerBuilder は TaskManager を構築
///
/// # 使用例
/// ```ignore
/// let manager = TaskManagerBuilder::new()
///     .config(config)
///     .store(store)
///     .register_typed::<ExpireLicenses, _>(ExpireLicensesHandler)?
///     .register(TaskDefinition::typed::<Alert, _>(AlertHandler).with_max_concurrency(2))?
///     .expect_tasks(&["licensing.expire", "alerting.check"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - `config.validate()` に失敗したら `BuildError::InvalidConfig`
/// - expect_tasks() の集合が登録済みでなければ `BuildError::MissingTaskTypes`
///
/// store を指定しなければ `InMemoryTaskStore` を使います。
pub struct TaskManagerBuilder {
    config: TaskManagerConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    owner_id: Option<OwnerId>,
    registry: TaskTypeRegistry,
    middleware: MiddlewareChain,
    decider: Arc<dyn Decider>,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError は TaskManager 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl TaskManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: TaskManagerConfig::default(),
            store: None,
            clock: Arc::new(SystemClock),
            ids: None,
            owner_id: None,
            registry: TaskTypeRegistry::new(),
            middleware: MiddlewareChain::new(),
            decider: Arc::new(DefaultDecider),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: TaskManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share one store between several managers to run them as competing pollers.
    pub fn store(mut self, store: impl TaskStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// Defaults to a generated `owner-<ulid>`.
    pub fn owner_id(mut self, owner_id: impl Into<OwnerId>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn decider(mut self, decider: impl Decider + 'static) -> Self {
        self.decider = Arc::new(decider);
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn register(mut self, definition: TaskDefinition) -> Result<Self, RegistryError> {
        self.registry.register(definition)?;
        Ok(self)
    }

    /// Handler を登録（既定の設定で）
    pub fn register_typed<T: TaskParams, H: Handler<T>>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<TaskManager, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(&TaskType::new(t.as_str())))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(SystemClock)),
        };
        let owner_id = self
            .owner_id
            .unwrap_or_else(|| ids.generate_owner_id());
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryTaskStore::new()),
        };

        let ctx = ManagerContext {
            owner_id,
            store,
            registry: Arc::new(self.registry),
            middleware: self.middleware,
            bus: EventBus::new(self.config.event_buffer_capacity),
            clock: self.clock,
            ids,
            decider: self.decider,
            defaults: self.config.task_defaults(),
        };
        Ok(TaskManager::new(Arc::new(ctx), self.config))
    }
}

impl Default for TaskManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
