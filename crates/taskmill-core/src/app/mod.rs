//! App - アプリケーション層
//!
//! このモジュールは、ports と typed を組み合わせてタスク管理のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **TaskManagerBuilder**: 構築とワイヤリング（起動時検証）
//! - **TaskManager / TaskManagerHandle**: lifecycle の起動と停止
//! - **TaskScheduling**: schedule / ensure_scheduled / run_now / ephemeral_run_now
//! - **PollingLifecycle**: 永続タスクの claim → run → complete ループ
//! - **EphemeralLifecycle**: ストアを使わない即時実行レーン
//! - **EventBus**: 両 lifecycle のイベントを流す broadcast
//! - **Middleware**: schedule 前 / run 前のフック

pub mod builder;
pub mod bus;
pub(crate) mod context;
pub(crate) mod ephemeral;
pub(crate) mod execution;
pub mod manager;
pub mod middleware;
pub(crate) mod polling;
pub mod scheduling;

#[cfg(test)]
mod testing;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, TaskManagerBuilder};
pub use self::bus::EventBus;
pub use self::manager::{TaskManager, TaskManagerHandle};
pub use self::middleware::{Middleware, MiddlewareChain, MiddlewareError};
pub use self::scheduling::TaskScheduling;
