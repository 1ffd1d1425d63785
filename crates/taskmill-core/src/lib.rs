//! taskmill-core
//!
//! Distributed task scheduling and claiming: many stateless instances share one task
//! store, each task has at most one active owner at a time, and a caller can await the
//! result of a task it triggered even though execution happens on a polling loop.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, record, claim, events, decision, retry, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, manager, scheduling, polling, ephemeral）
//! - **typed**: 型付き Task API（TaskParams, Handler, TaskDefinition, TaskTypeRegistry）
//! - **impls**: 実装（InMemoryTaskStore）
//! - **config**: TaskManagerConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;
