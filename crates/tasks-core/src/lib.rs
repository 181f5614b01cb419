//! tasks-core
//!
//! Durable task scheduling and execution engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, task state, node, operation, errors）
//! - **ports**: 抽象化レイヤー（Storage, Clock, IdGenerator, MetricsRegistry）
//! - **storage**: in-memory の `Storage` 実装
//! - **typed**: タスク実装側の API（Task trait, codec, Registry）
//! - **app**: engine（builder, scheduler, runners, execution context）
//! - **config**: `TasksConfig`

pub mod app;
pub mod config;
pub mod domain;
pub mod ports;
pub mod storage;
pub mod typed;

#[cfg(test)]
mod testing;

pub use app::{BuildError, Engine, EngineBuilder, ExecutionContext, Scheduler};
pub use config::{ConfigError, TasksConfig};
pub use domain::{RequestContext, Result, TaskError, TaskId, TaskStatus};
pub use typed::{Registry, Task, TaskType};
