//! Typed - 型付き Task API と task type registry
//!
//! このモジュールは task_type の typo を型で排除し、
//! params 型と Handler の対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `TaskParams` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `RunnerFactory` / `TaskRunner` trait - object-safe, type erasure
//!
//! lifecycle からは `TaskTypeRegistry` 経由で `TaskDefinition` を引き、
//! `RunnerFactory::create_task_runner` を instance ごとに呼びます。

pub mod definition;
pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::definition::{TaskDefaults, TaskDefinition};
pub use self::handler::{Handler, RunContext, RunnerFactory, TaskRunner, TypedHandler};
pub use self::registry::{RegistryError, TaskTypeRegistry};
pub use self::task::TaskParams;
