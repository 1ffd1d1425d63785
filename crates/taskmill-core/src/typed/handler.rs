//! Runner traits - claimed instance を実行する Runner の定義
//!
//! # 学習ポイント
//! - Object-safe trait (RunnerFactory, TaskRunner) を core が多態的に呼ぶ
//! - ジェネリック trait (Handler<T>) で params を型付きで受け取る
//! - Type erasure パターン (TypedHandler<T, H> → RunnerFactory)

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::task::TaskParams;
use crate::domain::{ConcreteTaskInstance, RunResult, RunnerError, TaskId, TaskType};

/// One execution of one instance. Consumed by `run`.
#[async_trait]
pub trait TaskRunner: Send {
    async fn run(self: Box<Self>) -> Result<RunResult, RunnerError>;
}

/// RunnerFactory は instance ごとに TaskRunner を作る
///
/// core は claim した instance（または ephemeral task）ごとに 1 回だけ呼びます。
/// params のデコード失敗などはここで `RunnerError` として返せます。
pub trait RunnerFactory: Send + Sync {
    fn create_task_runner(
        &self,
        instance: ConcreteTaskInstance,
    ) -> Result<Box<dyn TaskRunner>, RunnerError>;
}

/// What a typed handler sees besides its params.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub id: TaskId,
    pub task_type: TaskType,
    /// State left by the previous run (recurring tasks).
    pub state: serde_json::Value,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl RunContext {
    fn from_instance(instance: &ConcreteTaskInstance) -> Self {
        Self {
            id: instance.id.clone(),
            task_type: instance.task_type.clone(),
            state: instance.state.clone(),
            attempts: instance.attempts,
            started_at: instance.started_at,
        }
    }
}

/// Handler は型付き params を受け取って RunResult を返す
///
/// # 使用例
/// ```ignore
/// struct ExpireLicensesHandler;
///
/// #[async_trait]
/// impl Handler<ExpireLicenses> for ExpireLicensesHandler {
///     async fn run(&self, params: ExpireLicenses, ctx: RunContext) -> Result<RunResult, RunnerError> {
///         Ok(RunResult::with_state(ctx.state))
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<ExpireLicenses>` は `ExpireLicenses` しか受け取れない
/// - コンパイル時に params 型と Handler の対応が保証される
#[async_trait]
pub trait Handler<T: TaskParams>: Send + Sync + 'static {
    async fn run(&self, params: T, ctx: RunContext) -> Result<RunResult, RunnerError>;
}

pub struct TypedHandler<T: TaskParams, H: Handler<T>> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskParams, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

impl<T: TaskParams, H: Handler<T>> RunnerFactory for TypedHandler<T, H> {
    fn create_task_runner(
        &self,
        instance: ConcreteTaskInstance,
    ) -> Result<Box<dyn TaskRunner>, RunnerError> {
        let params: T = serde_json::from_value(instance.params.clone()).map_err(|e| {
            RunnerError::new(format!("invalid params for \"{}\": {e}", T::TYPE))
        })?;
        Ok(Box::new(TypedRunner {
            handler: Arc::clone(&self.handler),
            params,
            ctx: RunContext::from_instance(&instance),
            _marker: PhantomData,
        }))
    }
}

struct TypedRunner<T: TaskParams, H: Handler<T>> {
    handler: Arc<H>,
    params: T,
    ctx: RunContext,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: TaskParams, H: Handler<T>> TaskRunner for TypedRunner<T, H> {
    async fn run(self: Box<Self>) -> Result<RunResult, RunnerError> {
        let TypedRunner {
            handler,
            params,
            ctx,
            ..
        } = *self;
        handler.run(params, ctx).await
    }
}
