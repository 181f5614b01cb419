//! ExecutionContext - 実行中タスクから storage への窓口
//!
//! runner がロックした `TaskState` のコピーを持ち、すべての書き込みをその
//! コピー経由の CAS（`update_task`）で行います。`Mutex` で直列化しているので、
//! ひとつの実行が同じタスクに対して並行に CAS を発行することはありません。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::task::to_chrono;
use crate::domain::{Result, TaskError, TaskId, TaskState};
use crate::ports::{Clock, Storage};

pub struct ExecutionContext {
    task_id: TaskId,
    task_type: String,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(
        state: TaskState,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        token: CancellationToken,
    ) -> Self {
        Self {
            task_id: state.id,
            task_type: state.task_type.clone(),
            created_at: state.created_at,
            state: Mutex::new(state),
            storage,
            clock,
            token,
        }
    }

    pub fn get_task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn get_task_type(&self) -> &str {
        &self.task_type
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Cancelled on engine shutdown or when this runner loses the task.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Checkpoint. `state` is what `Task::save` returned.
    pub async fn save_state(&self, state: Vec<u8>) -> Result<()> {
        self.update(|s| s.state = state).await.map(drop)
    }

    pub async fn add_task_dependency(&self, id: TaskId) -> Result<()> {
        self.update(|s| {
            s.dependencies.insert(id);
        })
        .await
        .map(drop)
    }

    /// Expected completion time, counted from task creation.
    pub async fn set_estimate(&self, estimate: Duration) -> Result<()> {
        let estimated = self
            .created_at
            .checked_add_signed(to_chrono(estimate))
            .ok_or_else(|| {
                TaskError::non_retriable(format!("estimate {estimate:?} is out of range"))
            })?;
        self.update(|s| s.estimated_time = Some(estimated))
            .await
            .map(drop)
    }

    /// Reads events from storage; they are not part of the cached state.
    pub async fn has_event(&self, event: i64) -> Result<bool> {
        Ok(self.get_events().await?.contains(&event))
    }

    pub async fn get_events(&self) -> Result<Vec<i64>> {
        Ok(self.storage.get_task(self.task_id).await?.events)
    }

    /// Renews the lease.
    pub(crate) async fn ping(&self) -> Result<()> {
        self.update(|_| {}).await.map(drop)
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> TaskState {
        self.state.lock().await.clone()
    }

    /// Applies `f` to a copy of the cached state and CASes it into storage.
    /// The cache only changes if the write succeeds.
    pub(crate) async fn update(&self, f: impl FnOnce(&mut TaskState)) -> Result<TaskState> {
        let mut cached = self.state.lock().await;
        let mut next = cached.clone();
        f(&mut next);
        next.modified_at = self.clock.now();

        let stored = self.storage.update_task(next).await?;
        *cached = stored.clone();
        Ok(stored)
    }
}
