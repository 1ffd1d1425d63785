//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 開発用・テスト用の正本
//!
//! # 本番用実装
//! 本番用の TaskStore（ドキュメントストアなど version 付き条件書き込みを持つもの）は
//! 別クレートに配置します。

pub mod inmem_store;

// 主要な型を再エクスポート
pub use self::inmem_store::InMemoryTaskStore;
