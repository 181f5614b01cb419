//! App - アプリケーション層
//!
//! ports を組み合わせて engine を組み立てます。
//!
//! # 主要コンポーネント
//! - **EngineBuilder / Engine**: ワイヤリングと起動・停止
//! - **Scheduler**: タスクの投入・待機・キャンセル
//! - **runner**: poll → lock → execute のループ群（crate 内部）
//! - **ExecutionContext**: 実行中タスクから storage への窓口
//! - **tasks**: 組み込みタスク（Blank, ClearEndedTasks）

pub mod builder;
pub mod execution_context;
mod jitter;
mod runner;
mod runner_metrics;
pub mod scheduler;
pub mod tasks;

#[cfg(test)]
mod engine_tests;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::execution_context::ExecutionContext;
pub use self::scheduler::Scheduler;
pub use self::tasks::BlankTask;
