//! Middleware - schedule 前 / run 前に instance を変換・検証するフック
//!
//! 登録順に適用し、どれかが Err を返した時点で中断します。
//! before_run の変更は runner に渡す instance にだけ反映され、ストアには書きません。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ConcreteTaskInstance, TaskInstance};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MiddlewareError(pub String);

impl MiddlewareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_save(&self, task: TaskInstance) -> Result<TaskInstance, MiddlewareError> {
        Ok(task)
    }

    async fn before_run(
        &self,
        task: ConcreteTaskInstance,
    ) -> Result<ConcreteTaskInstance, MiddlewareError> {
        Ok(task)
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: impl Middleware + 'static) {
        self.layers.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub async fn before_save(&self, mut task: TaskInstance) -> Result<TaskInstance, MiddlewareError> {
        for layer in &self.layers {
            task = layer.before_save(task).await?;
        }
        Ok(task)
    }

    pub async fn before_run(
        &self,
        mut task: ConcreteTaskInstance,
    ) -> Result<ConcreteTaskInstance, MiddlewareError> {
        for layer in &self.layers {
            task = layer.before_run(task).await?;
        }
        Ok(task)
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("layers", &self.layers.len())
            .finish()
    }
}
