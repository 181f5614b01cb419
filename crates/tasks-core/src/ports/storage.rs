//! Storage port - タスクの永続化と状態遷移
//!
//! 状態遷移の排他制御は storage の CAS（`generation_id` の比較）だけで行います。
//! 実装はすべての操作を線形化可能にしなければなりません。
//!
//! # Whitelist
//! `task_types` が空のときはタイプで絞り込みません。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::{Node, Result, TaskId, TaskInfo, TaskSchedule, TaskState};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Assigns a fresh id, or returns the existing one for a known
    /// `(idempotency_key, account_id)` pair.
    async fn create_task(&self, state: TaskState) -> Result<TaskId>;

    /// Creates `max_tasks_inflight` regular instances of `template.task_type`
    /// when none are outstanding and the interval has elapsed.
    async fn create_regular_tasks(&self, template: TaskState, schedule: TaskSchedule)
        -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<TaskState>;

    async fn get_task_by_idempotency_key(
        &self,
        idempotency_key: &str,
        account_id: &str,
    ) -> Result<TaskState>;

    async fn list_tasks_ready_to_run(
        &self,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>>;

    async fn list_tasks_ready_to_cancel(
        &self,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>>;

    /// Running tasks whose lease expired and that were last held by another host.
    async fn list_tasks_stalling_while_running(
        &self,
        excluding_host: &str,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>>;

    async fn list_tasks_stalling_while_cancelling(
        &self,
        excluding_host: &str,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>>;

    async fn list_tasks_running(&self, limit: usize) -> Result<Vec<TaskInfo>>;

    async fn list_tasks_cancelling(&self, limit: usize) -> Result<Vec<TaskInfo>>;

    /// Non-silent failures (not client cancellations) that ended up on the
    /// cancel path at or after `since`.
    async fn list_failed_tasks(&self, since: DateTime<Utc>) -> Result<Vec<TaskInfo>>;

    /// Finished tasks created at or after `since` that overran their estimate
    /// by at least `estimate_miss`.
    async fn list_slow_tasks(
        &self,
        since: DateTime<Utc>,
        estimate_miss: Duration,
    ) -> Result<Vec<TaskInfo>>;

    async fn lock_task_to_run(
        &self,
        info: &TaskInfo,
        at: DateTime<Utc>,
        host: &str,
        runner: &str,
    ) -> Result<TaskState>;

    async fn lock_task_to_cancel(
        &self,
        info: &TaskInfo,
        at: DateTime<Utc>,
        host: &str,
        runner: &str,
    ) -> Result<TaskState>;

    /// `true` if the task is (or already was) on the cancel path.
    async fn mark_for_cancellation(&self, id: TaskId, at: DateTime<Utc>) -> Result<bool>;

    /// CAS on `generation_id`. Returns the stored record.
    async fn update_task(&self, state: TaskState) -> Result<TaskState>;

    async fn send_event(&self, id: TaskId, event: i64) -> Result<()>;

    /// Returns how many tasks were deleted.
    async fn clear_ended_tasks(&self, ended_before: DateTime<Utc>, limit: usize)
        -> Result<usize>;

    async fn pause_task(&self, id: TaskId) -> Result<()>;

    async fn resume_task(&self, id: TaskId) -> Result<()>;

    async fn heartbeat(&self, host: &str, at: DateTime<Utc>, inflight_task_count: u32)
        -> Result<()>;

    async fn get_alive_nodes(&self) -> Result<Vec<Node>>;

    async fn get_node(&self, host: &str) -> Result<Node>;
}
