//! TaskDefinition - task_type ごとの実行設定
//!
//! # 含まれる設定
//! - title / description（エラーメッセージや一覧表示用）
//! - max_concurrency（クラスタ全体での同時実行上限）
//! - timeout（runner の実行時間上限。claim のリース期間にもなる）
//! - max_attempts / retry（失敗時の再試行回数とバックオフ）
//!
//! 未指定の項目は `TaskDefaults`（config 由来）で埋めます。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::handler::{Handler, RunnerFactory, TypedHandler};
use super::task::TaskParams;
use crate::domain::{ClaimPolicy, RetryPolicy, TaskType};

/// Manager-wide fallbacks for per-type settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefaults {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct TaskDefinition {
    pub task_type: TaskType,
    pub title: String,
    pub description: Option<String>,
    /// `None` = unbounded.
    pub max_concurrency: Option<usize>,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub retry: Option<RetryPolicy>,
    pub factory: Arc<dyn RunnerFactory>,
}

impl TaskDefinition {
    /// Title defaults to the type name.
    pub fn new(task_type: impl Into<String>, factory: impl RunnerFactory + 'static) -> Self {
        let task_type = TaskType::new(task_type);
        Self {
            title: task_type.to_string(),
            task_type,
            description: None,
            max_concurrency: None,
            timeout: None,
            max_attempts: None,
            retry: None,
            factory: Arc::new(factory),
        }
    }

    /// Definition for a typed handler; the type name comes from `T::TYPE`.
    pub fn typed<T: TaskParams, H: Handler<T>>(handler: H) -> Self {
        Self::new(T::TYPE, TypedHandler::<T, H>::new(handler))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn effective_timeout(&self, defaults: &TaskDefaults) -> Duration {
        self.timeout.unwrap_or(defaults.timeout)
    }

    pub fn effective_max_attempts(&self, defaults: &TaskDefaults) -> u32 {
        self.max_attempts.unwrap_or(defaults.max_attempts)
    }

    pub fn effective_retry<'a>(&'a self, defaults: &'a TaskDefaults) -> &'a RetryPolicy {
        self.retry.as_ref().unwrap_or(&defaults.retry)
    }

    pub fn claim_policy(&self, defaults: &TaskDefaults) -> ClaimPolicy {
        ClaimPolicy {
            max_concurrency: self.max_concurrency,
            max_attempts: self.effective_max_attempts(defaults),
            timeout: self.effective_timeout(defaults),
        }
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_type", &self.task_type)
            .field("title", &self.title)
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::EchoHandler;
    use crate::typed::task::fixtures::Echo;

    #[test]
    fn typed_definition_takes_its_name_from_the_params() {
        let def = TaskDefinition::typed::<Echo, _>(EchoHandler)
            .with_title("Echo")
            .with_max_concurrency(2);

        assert_eq!(def.task_type.as_str(), Echo::TYPE);
        assert_eq!(def.title, "Echo");
        assert_eq!(def.max_concurrency, Some(2));
    }

    #[test]
    fn unset_settings_fall_back_to_defaults() {
        let defaults = TaskDefaults::default();
        let def = TaskDefinition::typed::<Echo, _>(EchoHandler);

        let policy = def.claim_policy(&defaults);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_concurrency, None);
        assert_eq!(policy.timeout, defaults.timeout);
        assert_eq!(def.effective_retry(&defaults), &defaults.retry);

        let def = def
            .with_max_attempts(1)
            .with_timeout(Duration::from_secs(5));
        let policy = def.claim_policy(&defaults);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.timeout, Duration::from_secs(5));
    }
}
