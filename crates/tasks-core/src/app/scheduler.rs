//! Scheduler - タスクの投入・待機・キャンセル
//!
//! 呼び出し側（API ハンドラや他のタスク）が使う入口です。
//! - 投入: request をエンコードして `create_task`（idempotency key で重複排除）
//! - 待機: storage を `poll_for_task_updates_period` ごとに polling
//! - 定期タスク: `schedule_regular_tasks` がバックグラウンドで `create_regular_tasks` を呼び続ける

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::execution_context::ExecutionContext;
use super::jitter::jittered;
use super::tasks::BlankTask;
use crate::config::TasksConfig;
use crate::domain::{
    ErrorCode, Operation, OperationResult, RequestContext, Result, TaskError, TaskId,
    TaskSchedule, TaskState, TaskStatus,
};
use crate::ports::{Clock, Storage};
use crate::typed::{Registry, Task, TaskType, codec};

#[derive(Clone)]
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    registry: Registry,
    clock: Arc<dyn Clock>,
    config: Arc<TasksConfig>,
    shutdown: CancellationToken,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        registry: Registry,
        clock: Arc<dyn Clock>,
        config: Arc<TasksConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            registry,
            clock,
            config,
            shutdown,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the id of the new task, or of the task that already holds
    /// `ctx.idempotency_key`.
    pub async fn schedule_task<R: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        task_type: &str,
        description: &str,
        request: &R,
        cloud_id: &str,
        folder_id: &str,
    ) -> Result<TaskId> {
        self.schedule_zonal_task(ctx, task_type, description, "", request, cloud_id, folder_id)
            .await
    }

    /// Like `schedule_task`, but only runners configured for `zone_id` see it.
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_zonal_task<R: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        task_type: &str,
        description: &str,
        zone_id: &str,
        request: &R,
        cloud_id: &str,
        folder_id: &str,
    ) -> Result<TaskId> {
        let mut task = TaskState::new(task_type, self.clock.now());
        task.idempotency_key = ctx.idempotency_key.clone();
        task.account_id = ctx.account_id.clone();
        task.created_by = ctx.created_by.clone();
        task.description = description.to_string();
        task.request = codec::encode(request)?;
        task.zone_id = zone_id.to_string();
        task.cloud_id = cloud_id.to_string();
        task.folder_id = folder_id.to_string();

        let id = self.storage.create_task(task).await?;
        debug!(task_id = %id, task_type, idempotency_key = %ctx.idempotency_key, "task scheduled");
        Ok(id)
    }

    pub async fn schedule_blank_task(&self, ctx: &RequestContext) -> Result<TaskId> {
        self.schedule_task(ctx, BlankTask::TYPE, "blank task", &(), "", "")
            .await
    }

    /// Spawns a loop that keeps `schedule.max_tasks_inflight` instances of
    /// `task_type` alive. Stops on engine shutdown.
    pub fn schedule_regular_tasks(
        &self,
        task_type: &str,
        description: &str,
        schedule: TaskSchedule,
    ) {
        let scheduler = self.clone();
        let task_type = task_type.to_string();
        let description = description.to_string();

        let handle = tokio::spawn(async move {
            let config = &scheduler.config;
            loop {
                let mut template = TaskState::new(task_type.as_str(), scheduler.clock.now());
                template.description = description.clone();
                if let Err(err) = scheduler
                    .storage
                    .create_regular_tasks(template, schedule)
                    .await
                {
                    warn!(task_type = %task_type, error = %err, "failed to schedule regular tasks");
                }

                let period = jittered(
                    config.schedule_regular_tasks_period_min,
                    config.schedule_regular_tasks_period_max,
                );
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!(task_type = %task_type, "regular task scheduling stopped");
        });

        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub(crate) fn take_background(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// For use inside `Task::run`. Waits up to `task_waiting_timeout`; if `id`
    /// is still pending, records it as a dependency of the calling task and
    /// returns `InterruptExecution` so the runner parks the caller until `id`
    /// resolves.
    pub async fn wait_task(&self, exec: &ExecutionContext, id: TaskId) -> Result<Value> {
        let deadline = Instant::now() + self.config.task_waiting_timeout;
        loop {
            let task = self.storage.get_task(id).await?;
            if let Some(result) = self.ended_result(&task).await {
                return result;
            }
            if Instant::now() >= deadline {
                break;
            }

            tokio::select! {
                _ = exec.cancellation_token().cancelled() => return Err(TaskError::InterruptExecution),
                _ = tokio::time::sleep(self.config.poll_for_task_updates_period) => {}
            }
        }

        exec.add_task_dependency(id).await?;
        debug!(task_id = %exec.get_task_id(), dependency = %id, "waiting on dependency");
        Err(TaskError::InterruptExecution)
    }

    /// Blocks until `id` finishes or fails. Times out with a non-retriable error.
    pub async fn wait_task_sync(&self, id: TaskId, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self.storage.get_task(id).await?;
            if let Some(result) = self.ended_result(&task).await {
                return result;
            }
            if Instant::now() >= deadline {
                return Err(TaskError::non_retriable(format!(
                    "timed out waiting for task {id} after {timeout:?}"
                )));
            }
            self.sleep_or_shutdown(self.config.poll_for_task_updates_period)
                .await?;
        }
    }

    /// Returns the subset of `ids` that have ended, once it is non-empty.
    pub async fn wait_any_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskId>> {
        loop {
            let mut ended = Vec::new();
            for id in ids {
                if self.storage.get_task(*id).await?.status.is_ended() {
                    ended.push(*id);
                }
            }
            if !ended.is_empty() {
                return Ok(ended);
            }
            self.sleep_or_shutdown(self.config.poll_for_task_updates_period)
                .await?;
        }
    }

    /// Blocks until `id` is `Finished` or `Cancelled`, whatever the outcome.
    pub async fn wait_task_ended(&self, id: TaskId) -> Result<()> {
        loop {
            if self.storage.get_task(id).await?.status.is_ended() {
                return Ok(());
            }
            self.sleep_or_shutdown(self.config.poll_for_task_updates_period)
                .await?;
        }
    }

    pub async fn cancel_task(&self, id: TaskId) -> Result<bool> {
        let cancelling = self
            .storage
            .mark_for_cancellation(id, self.clock.now())
            .await?;
        debug!(task_id = %id, cancelling, "cancellation requested");
        Ok(cancelling)
    }

    pub async fn get_task_metadata(&self, id: TaskId) -> Result<Value> {
        let task = self.storage.get_task(id).await?;
        self.load(&task).await?.get_metadata(id).await
    }

    pub async fn send_event(&self, id: TaskId, event: i64) -> Result<()> {
        self.storage.send_event(id, event).await
    }

    pub async fn pause_task(&self, id: TaskId) -> Result<()> {
        self.storage.pause_task(id).await
    }

    pub async fn resume_task(&self, id: TaskId) -> Result<()> {
        self.storage.resume_task(id).await
    }

    pub async fn get_operation(&self, id: TaskId) -> Result<Operation> {
        let task = self.storage.get_task(id).await?;
        let loaded = self.load(&task).await?;

        let done = task.status.is_done();
        let result = match task.status {
            TaskStatus::Finished => Some(OperationResult::Response(loaded.get_response())),
            status if status.is_cancelling() => {
                let (code, message, details) = match task.error() {
                    Some(TaskError::Failed {
                        code,
                        message,
                        details,
                    }) => (code, message, details),
                    _ => (ErrorCode::Cancelled, cancelled_message(id), None),
                };
                Some(OperationResult::Error {
                    code,
                    message,
                    details,
                })
            }
            _ => None,
        };

        Ok(Operation {
            id,
            description: task.description.clone(),
            created_at: task.created_at,
            created_by: task.created_by.clone(),
            modified_at: task.modified_at,
            done,
            metadata: loaded.get_metadata(id).await?,
            result,
        })
    }

    async fn load(&self, task: &TaskState) -> Result<Box<dyn Task>> {
        let mut loaded = self.registry.new_task(&task.task_type)?;
        loaded.load(&task.request, &task.state).await?;
        Ok(loaded)
    }

    /// `None` while the task is still on the run path.
    async fn ended_result(&self, task: &TaskState) -> Option<Result<Value>> {
        match task.status {
            TaskStatus::Finished => Some(self.load(task).await.map(|t| t.get_response())),
            status if status.is_cancelling() => Some(Err(task.error().unwrap_or_else(|| {
                TaskError::Failed {
                    code: ErrorCode::Cancelled,
                    message: cancelled_message(task.id),
                    details: None,
                }
            }))),
            _ => None,
        }
    }

    async fn sleep_or_shutdown(&self, period: Duration) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TaskError::non_retriable("scheduler is shutting down")),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }
}

fn cancelled_message(id: TaskId) -> String {
    format!("task {id} was cancelled")
}
