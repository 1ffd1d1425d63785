//! TaskTypeRegistry - TaskDefinition の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された RunnerFactory の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権（lifecycle 間で同じ registry を共有）

use std::collections::HashMap;
use std::sync::Arc;

use super::definition::{TaskDefaults, TaskDefinition};
use super::handler::Handler;
use super::task::TaskParams;
use crate::domain::{ClaimPolicy, TaskType};

/// TaskTypeRegistry は task_type → TaskDefinition の対応表
///
/// # 使用例
/// ```ignore
/// let mut registry = TaskTypeRegistry::new();
/// registry.register_typed::<ExpireLicenses, _>(ExpireLicensesHandler)?;
/// registry.register(
///     TaskDefinition::typed::<Alert, _>(AlertHandler).with_max_concurrency(2),
/// )?;
///
/// let def = registry.get(&TaskType::new("licensing.expire"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskTypeRegistry {
    definitions: HashMap<TaskType, Arc<TaskDefinition>>,
}

/// RegistryError は TaskTypeRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), RegistryError> {
        let task_type = definition.task_type.clone();
        if self.definitions.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.definitions.insert(task_type, Arc::new(definition));
        Ok(())
    }

    pub fn register_typed<T: TaskParams, H: Handler<T>>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register(TaskDefinition::typed::<T, H>(handler))
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<TaskDefinition>> {
        self.definitions.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.definitions.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    /// The per-type limits the claim query needs. Only registered types are claimable.
    pub fn claim_policies(&self, defaults: &TaskDefaults) -> HashMap<TaskType, ClaimPolicy> {
        self.definitions
            .iter()
            .map(|(task_type, def)| (task_type.clone(), def.claim_policy(defaults)))
            .collect()
    }
}
