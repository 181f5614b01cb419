//! Runners - タスクを claim して実行するループ群
//!
//! runner はそれぞれ独立した tokio task で、一度にひとつのタスクだけを実行します。
//! - poll: jitter 付きの sleep → listing → shuffle → inflight 枠の確保 → lock
//! - execute: `run` / `cancel` を別 task に spawn（panic を閉じ込める）し、
//!   その間 lease を ping で更新し続ける
//! - ping が `WrongGeneration` になったら所有権を失ったとみなし、実行を止めて結果を捨てる

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::execution_context::ExecutionContext;
use super::jitter::jittered;
use super::runner_metrics::RunnerMetrics;
use crate::config::TasksConfig;
use crate::domain::task::to_chrono;
use crate::domain::{Result, RunnerId, TaskError, TaskInfo, TaskState, TaskStatus};
use crate::ports::{Clock, IdGenerator, Storage};
use crate::typed::{Registry, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunnerKind {
    Run,
    Cancel,
    StallingRun,
    StallingCancel,
}

impl RunnerKind {
    fn is_run(self) -> bool {
        matches!(self, RunnerKind::Run | RunnerKind::StallingRun)
    }

    fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Run => "run",
            RunnerKind::Cancel => "cancel",
            RunnerKind::StallingRun => "stalling_run",
            RunnerKind::StallingCancel => "stalling_cancel",
        }
    }
}

/// Per-host, per-type count of executions in progress.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    counts: Mutex<HashMap<String, u64>>,
}

impl Inflight {
    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` when `limit` executions of `task_type` are already running here.
    pub(crate) fn try_acquire(
        self: &Arc<Self>,
        task_type: &str,
        limit: Option<u64>,
    ) -> Option<InflightGuard> {
        let mut counts = self.counts();
        let count = counts.entry(task_type.to_string()).or_default();
        if limit.is_some_and(|limit| *count >= limit) {
            return None;
        }
        *count += 1;
        Some(InflightGuard {
            inflight: Arc::clone(self),
            task_type: task_type.to_string(),
        })
    }

    pub(crate) fn total(&self) -> u64 {
        self.counts().values().sum()
    }
}

pub(crate) struct InflightGuard {
    inflight: Arc<Inflight>,
    task_type: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut counts = self.inflight.counts();
        if let Some(count) = counts.get_mut(&self.task_type) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Everything a runner needs; cheap to clone.
#[derive(Clone)]
pub(crate) struct RunnerContext {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) registry: Registry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<TasksConfig>,
    pub(crate) host: String,
    pub(crate) metrics: RunnerMetrics,
    pub(crate) inflight: Arc<Inflight>,
    pub(crate) shutdown: CancellationToken,
}

enum Outcome {
    /// `Some(state)` for a successful run.
    Completed(Result<Option<Vec<u8>>>),
    Panicked(String),
    Lost,
}

impl Outcome {
    fn from_join_error(err: JoinError) -> Self {
        if !err.is_panic() {
            return Outcome::Lost;
        }
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Outcome::Panicked(message)
    }
}

struct Runner {
    id: RunnerId,
    kind: RunnerKind,
    ctx: RunnerContext,
}

/// Spawns every runner kind plus the heartbeat loop.
pub(crate) fn spawn_runners(ctx: &RunnerContext, ids: &dyn IdGenerator) -> Vec<JoinHandle<()>> {
    let config = &ctx.config;
    let plan = [
        (RunnerKind::Run, config.runners_count),
        (RunnerKind::Cancel, config.runners_count),
        (RunnerKind::StallingRun, config.stalking_runners_count),
        (RunnerKind::StallingCancel, config.stalking_runners_count),
    ];

    let mut joins = Vec::new();
    for (kind, count) in plan {
        for _ in 0..count {
            let runner = Runner {
                id: ids.generate_runner_id(),
                kind,
                ctx: ctx.clone(),
            };
            joins.push(tokio::spawn(runner.run_loop()));
        }
    }
    joins.push(tokio::spawn(heartbeat_loop(ctx.clone())));

    info!(
        host = %ctx.host,
        runners = config.runners_count,
        stalking_runners = config.stalking_runners_count,
        "runners started"
    );
    joins
}

async fn heartbeat_loop(ctx: RunnerContext) {
    loop {
        let inflight = u32::try_from(ctx.inflight.total()).unwrap_or(u32::MAX);
        if let Err(err) = ctx.storage.heartbeat(&ctx.host, ctx.clock.now(), inflight).await {
            warn!(host = %ctx.host, error = %err, "heartbeat failed");
        }

        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.heartbeat_period) => {}
        }
    }
}

impl Runner {
    async fn run_loop(self) {
        let config = &self.ctx.config;
        let (min, max) = match self.kind {
            RunnerKind::Run | RunnerKind::Cancel => {
                (config.poll_for_tasks_period_min, config.poll_for_tasks_period_max)
            }
            RunnerKind::StallingRun | RunnerKind::StallingCancel => (
                config.poll_for_stalling_tasks_period_min,
                config.poll_for_stalling_tasks_period_max,
            ),
        };

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered(min, max)) => {}
            }

            if let Err(err) = self.poll_once().await {
                warn!(runner = %self.id, kind = self.kind.as_str(), error = %err, "failed to poll for tasks");
            }
        }
        debug!(runner = %self.id, kind = self.kind.as_str(), "runner stopped");
    }

    /// Returns whether a task was executed.
    async fn poll_once(&self) -> Result<bool> {
        let whitelist = self.ctx.registry.task_types_for_execution();
        if whitelist.is_empty() {
            return Ok(false);
        }

        let storage = &self.ctx.storage;
        let limit = self.ctx.config.tasks_to_list_limit;
        let mut infos = match self.kind {
            RunnerKind::Run => storage.list_tasks_ready_to_run(limit, &whitelist).await?,
            RunnerKind::Cancel => storage.list_tasks_ready_to_cancel(limit, &whitelist).await?,
            RunnerKind::StallingRun => {
                storage
                    .list_tasks_stalling_while_running(&self.ctx.host, limit, &whitelist)
                    .await?
            }
            RunnerKind::StallingCancel => {
                storage
                    .list_tasks_stalling_while_cancelling(&self.ctx.host, limit, &whitelist)
                    .await?
            }
        };
        infos.shuffle(&mut rand::thread_rng());

        for info in infos {
            let limit = self.ctx.config.inflight_limit(&info.task_type);
            let Some(guard) = self.ctx.inflight.try_acquire(&info.task_type, limit) else {
                continue;
            };

            let state = match self.lock(&info).await {
                Ok(state) => state,
                Err(err) => {
                    debug!(task_id = %info.id, runner = %self.id, error = %err, "failed to lock task");
                    continue;
                }
            };

            self.execute(state, guard).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn lock(&self, info: &TaskInfo) -> Result<TaskState> {
        let at = self.ctx.clock.now();
        let runner = self.id.to_string();
        if self.kind.is_run() {
            self.ctx
                .storage
                .lock_task_to_run(info, at, &self.ctx.host, &runner)
                .await
        } else {
            self.ctx
                .storage
                .lock_task_to_cancel(info, at, &self.ctx.host, &runner)
                .await
        }
    }

    async fn execute(&self, state: TaskState, _guard: InflightGuard) {
        let task_type = state.task_type.clone();
        let exec = Arc::new(ExecutionContext::new(
            state.clone(),
            Arc::clone(&self.ctx.storage),
            Arc::clone(&self.ctx.clock),
            self.ctx.shutdown.child_token(),
        ));
        debug!(
            task_id = %state.id,
            task_type = %task_type,
            kind = self.kind.as_str(),
            generation = state.generation_id,
            "executing task"
        );

        self.ctx.metrics.on_execution_started(&task_type);
        let outcome = match self.prepare(&state).await {
            Ok(task) => self.supervise(task, &exec).await,
            Err(err) => Outcome::Completed(Err(err)),
        };
        self.ctx.metrics.on_execution_stopped(&task_type);

        let persisted = match (self.kind.is_run(), outcome) {
            (_, Outcome::Lost) => return,
            (true, Outcome::Completed(result)) => self.finish_run(&exec, result).await,
            (true, Outcome::Panicked(message)) => {
                let err = TaskError::Panic { message };
                self.ctx.metrics.on_error(&task_type, &err);
                error!(task_id = %state.id, task_type = %task_type, error = %err, "task panicked");
                self.retry_or_fail(&exec, err, true).await
            }
            (false, Outcome::Completed(result)) => self.finish_cancel(&exec, result, false).await,
            (false, Outcome::Panicked(message)) => {
                self.finish_cancel(&exec, Err(TaskError::Panic { message }), true)
                    .await
            }
        };

        if let Err(err) = persisted {
            if err.is_wrong_generation() {
                self.ctx.metrics.on_error(&task_type, &err);
                debug!(task_id = %state.id, "ownership lost, dropping outcome");
            } else {
                warn!(task_id = %state.id, error = %err, "failed to persist task outcome");
            }
        }
    }

    async fn prepare(&self, state: &TaskState) -> Result<Box<dyn Task>> {
        let mut task = self.ctx.registry.new_task_for_execution(&state.task_type)?;
        task.load(&state.request, &state.state).await?;
        Ok(task)
    }

    async fn supervise(&self, mut task: Box<dyn Task>, exec: &Arc<ExecutionContext>) -> Outcome {
        let config = &self.ctx.config;
        let task_type = exec.get_task_type().to_string();
        let task_id = exec.get_task_id();

        let is_run = self.kind.is_run();
        let spawned = Arc::clone(exec);
        let mut handle = tokio::spawn(async move {
            if is_run {
                task.run(&spawned).await?;
                task.save().map(Some)
            } else {
                task.cancel(&spawned).await.map(|()| None)
            }
        });

        let mut ping = tokio::time::interval(config.task_ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut hanging_check = tokio::time::interval(config.hanging_task_check_period);
        hanging_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        hanging_check.tick().await;
        let mut hanging = false;

        let outcome = loop {
            tokio::select! {
                joined = &mut handle => {
                    break match joined {
                        Ok(result) => Outcome::Completed(result),
                        Err(err) => Outcome::from_join_error(err),
                    };
                }
                _ = ping.tick() => match exec.ping().await {
                    Ok(()) => {}
                    Err(err) if err.is_wrong_generation() => {
                        self.ctx.metrics.on_error(&task_type, &err);
                        warn!(task_id = %task_id, runner = %self.id, "lost ownership of task, stopping execution");
                        exec.cancellation_token().cancel();
                        handle.abort();
                        break Outcome::Lost;
                    }
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "failed to ping task");
                    }
                },
                _ = hanging_check.tick(), if !hanging => {
                    if self.is_hanging(exec) {
                        hanging = true;
                        self.ctx.metrics.on_hanging(&task_type, 1);
                        if self.ctx.metrics.should_log_hanging() {
                            warn!(
                                task_id = %task_id,
                                task_type = %task_type,
                                created_at = %exec.created_at(),
                                "task is hanging"
                            );
                        }
                    }
                }
            }
        };

        if hanging {
            self.ctx.metrics.on_hanging(&task_type, -1);
        }
        outcome
    }

    fn is_hanging(&self, exec: &ExecutionContext) -> bool {
        let config = &self.ctx.config;
        if config
            .except_hanging_task_types
            .iter()
            .any(|t| t == exec.get_task_type())
        {
            return false;
        }
        self.ctx.clock.now() - exec.created_at() > to_chrono(config.hanging_task_timeout)
    }

    async fn finish_run(
        &self,
        exec: &ExecutionContext,
        result: Result<Option<Vec<u8>>>,
    ) -> Result<TaskState> {
        let task_id = exec.get_task_id();
        let task_type = exec.get_task_type();
        match result {
            Ok(saved) => {
                let finished = exec
                    .update(|s| {
                        s.status = TaskStatus::Finished;
                        if let Some(state) = saved {
                            s.state = state;
                        }
                    })
                    .await?;
                info!(task_id = %task_id, task_type = %task_type, "task finished");
                Ok(finished)
            }
            Err(err) if err.is_interrupt() => {
                debug!(task_id = %task_id, "task execution interrupted");
                exec.update(|s| s.status = TaskStatus::ReadyToRun).await
            }
            Err(err) if err.is_wrong_generation() => Err(err),
            Err(err) => {
                self.ctx.metrics.on_error(task_type, &err);
                self.retry_or_fail(exec, err, false).await
            }
        }
    }

    /// Bounded retry: back to `ReadyToRun` while the budget lasts, otherwise
    /// `ReadyToCancel` with the error recorded.
    async fn retry_or_fail(
        &self,
        exec: &ExecutionContext,
        err: TaskError,
        panicked: bool,
    ) -> Result<TaskState> {
        let max = self.ctx.config.max_retriable_error_count;
        let retriable = panicked || err.is_retriable();
        let ignore_limit = err.ignores_retry_limit();

        let mut retried = false;
        let stored = exec
            .update(|s| {
                if panicked {
                    s.panic_count += 1;
                }
                if retriable && (ignore_limit || s.retriable_error_count < max) {
                    s.retriable_error_count += 1;
                    s.status = TaskStatus::ReadyToRun;
                    retried = true;
                } else {
                    s.status = TaskStatus::ReadyToCancel;
                    s.set_error(&err);
                }
            })
            .await?;

        let task_id = exec.get_task_id();
        if retried {
            warn!(
                task_id = %task_id,
                retriable_error_count = stored.retriable_error_count,
                error = %err,
                "task failed, will retry"
            );
        } else if err.is_silent() {
            info!(task_id = %task_id, error = %err, "task failed silently");
        } else {
            error!(task_id = %task_id, error = %err, "task failed");
        }
        Ok(stored)
    }

    async fn finish_cancel(
        &self,
        exec: &ExecutionContext,
        result: Result<Option<Vec<u8>>>,
        panicked: bool,
    ) -> Result<TaskState> {
        let task_id = exec.get_task_id();
        let task_type = exec.get_task_type();
        match result {
            Ok(_) => {
                let cancelled = exec.update(|s| s.status = TaskStatus::Cancelled).await?;
                info!(task_id = %task_id, task_type = %task_type, "task cancelled");
                Ok(cancelled)
            }
            Err(err) if err.is_wrong_generation() => Err(err),
            Err(err) if err.is_retriable() || err.is_interrupt() => {
                self.ctx.metrics.on_error(task_type, &err);
                debug!(task_id = %task_id, error = %err, "cancellation will be retried");
                exec.update(|s| s.status = TaskStatus::ReadyToCancel).await
            }
            Err(err) => {
                self.ctx.metrics.on_error(task_type, &err);
                error!(task_id = %task_id, error = %err, "cancellation failed, giving up");
                exec.update(|s| {
                    if panicked {
                        s.panic_count += 1;
                    }
                    s.status = TaskStatus::Cancelled;
                })
                .await
            }
        }
    }
}
