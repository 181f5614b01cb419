//! Typed - タスク実装側の API
//!
//! - `Task`: object-safe な実行単位（`Box<dyn Task>` で registry から生成）
//! - `TaskType`: `const TYPE` で task_type を型に結び付ける
//! - `codec`: request/state の JSON エンコード
//! - `Registry`: task_type → factory

pub mod codec;
pub mod registry;
pub mod task;

pub use self::registry::{Registry, RegistryError, TaskFactory};
pub use self::task::{Task, TaskType};
