//! TaskParams trait - 型付き params の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{EphemeralTask, TaskInstance, TaskType};

/// TaskParams は task_type と params の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ExpireLicenses {
///     grace_days: u32,
/// }
///
/// impl TaskParams for ExpireLicenses {
///     const TYPE: &'static str = "licensing.expire";
/// }
///
/// let instance = ExpireLicenses { grace_days: 3 }.to_instance()?;
/// ```
///
/// # Trait Bounds
/// - `Serialize`: params をレコードに保存するため
/// - `DeserializeOwned`: レコードから復元するため
/// - `Send + Sync + 'static`: runner として別タスクに渡すため
pub trait TaskParams: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    fn task_type() -> TaskType {
        TaskType::new(Self::TYPE)
    }

    /// A persisted instance carrying these params (run as soon as possible, no id).
    fn to_instance(&self) -> Result<TaskInstance, serde_json::Error> {
        Ok(TaskInstance::new(Self::task_type()).with_params(serde_json::to_value(self)?))
    }

    fn to_ephemeral(&self) -> Result<EphemeralTask, serde_json::Error> {
        Ok(EphemeralTask::new(
            Self::task_type(),
            serde_json::to_value(self)?,
        ))
    }
}
