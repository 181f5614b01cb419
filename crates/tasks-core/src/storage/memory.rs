//! In-memory storage implementation.
//!
//! All operations take one `tokio::sync::Mutex`, so every call is linearizable.
//! Tasks are kept in a `BTreeMap` keyed by ULID. Ids come from a monotonic
//! `UlidGenerator`, so listings come out in creation order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::metrics::StorageMetrics;
use crate::config::TasksConfig;
use crate::domain::task::to_chrono;
use crate::domain::{
    ErrorCode, Node, Result, Schedule, TaskError, TaskId, TaskInfo, TaskSchedule, TaskState,
    TaskStatus,
};
use crate::ports::{Clock, IdGenerator, MetricsRegistry, Storage};

/// The subset of `TasksConfig` storage cares about.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub zone_ids: Vec<String>,
    pub task_stalling_timeout: Duration,
    pub node_liveness_timeout: Duration,
}

impl From<&TasksConfig> for StorageConfig {
    fn from(config: &TasksConfig) -> Self {
        Self {
            zone_ids: config.zone_ids.clone(),
            task_stalling_timeout: config.task_stalling_timeout,
            node_liveness_timeout: config.node_liveness_timeout,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::from(&TasksConfig::default())
    }
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskId, TaskState>,
    /// (idempotency_key, account_id) -> id
    idempotency: HashMap<(String, String), TaskId>,
    schedules: HashMap<String, Schedule>,
    nodes: HashMap<String, Node>,
}

impl State {
    fn get(&self, id: TaskId) -> Result<&TaskState> {
        self.tasks.get(&id).ok_or_else(|| TaskError::not_found(id))
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskState> {
        self.tasks.get_mut(&id).ok_or_else(|| TaskError::not_found(id))
    }

    /// Unknown ids count as resolved: they were purged or never existed.
    fn is_resolved(&self, id: &TaskId) -> bool {
        self.tasks
            .get(id)
            .is_none_or(|t| t.status.resolves_dependants())
    }

    fn prune_resolved(&self, deps: &mut BTreeSet<TaskId>) {
        deps.retain(|dep| !self.is_resolved(dep));
    }

    fn add_dependant(&mut self, dep: TaskId, dependant: TaskId) {
        if let Some(task) = self.tasks.get_mut(&dep) {
            task.dependants.insert(dependant);
        }
    }

    fn remove_dependant(&mut self, dep: TaskId, dependant: TaskId) {
        if let Some(task) = self.tasks.get_mut(&dep) {
            task.dependants.remove(&dependant);
        }
    }

    /// `id` just resolved: drop it from every dependant's dependency set.
    /// Dependants left without dependencies while `WaitingToRun` become runnable.
    fn propagate_resolution(&mut self, id: TaskId, at: DateTime<Utc>) {
        let dependants = match self.tasks.get_mut(&id) {
            Some(task) => std::mem::take(&mut task.dependants),
            None => return,
        };
        for dependant in dependants {
            let Some(task) = self.tasks.get_mut(&dependant) else {
                continue;
            };
            task.dependencies.remove(&id);
            if task.dependencies.is_empty() && task.status == TaskStatus::WaitingToRun {
                task.status = TaskStatus::ReadyToRun;
                task.generation_id += 1;
                task.changed_state_at = at;
            }
        }
    }

    fn insert_new(&mut self, id: TaskId, mut task: TaskState) -> TaskId {
        task.id = id;
        task.generation_id = 0;
        task.changed_state_at = task.created_at;
        task.dependants.clear();
        task.events.clear();

        let mut deps = std::mem::take(&mut task.dependencies);
        self.prune_resolved(&mut deps);
        for dep in &deps {
            self.add_dependant(*dep, id);
        }
        task.dependencies = deps;

        if task.status == TaskStatus::ReadyToRun && !task.dependencies.is_empty() {
            task.status = TaskStatus::WaitingToRun;
        }

        if !task.idempotency_key.is_empty() {
            self.idempotency.insert(
                (task.idempotency_key.clone(), task.account_id.clone()),
                id,
            );
        }
        self.tasks.insert(id, task);
        id
    }

    fn remove(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        let key = (task.idempotency_key.clone(), task.account_id.clone());
        if self.idempotency.get(&key) == Some(&id) {
            self.idempotency.remove(&key);
        }
        for dep in &task.dependencies {
            self.remove_dependant(*dep, id);
        }
    }
}

pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    metrics: StorageMetrics,
}

impl InMemoryStorage {
    pub fn new(
        config: StorageConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        metrics: Arc<dyn MetricsRegistry>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            config,
            clock,
            ids,
            metrics: StorageMetrics::new(metrics),
        }
    }

    fn whitelisted(task_types: &[String], task: &TaskState) -> bool {
        task_types.is_empty() || task_types.contains(&task.task_type)
    }

    async fn list(
        &self,
        limit: usize,
        filter: impl Fn(&State, &TaskState) -> bool,
    ) -> Vec<TaskInfo> {
        let state = self.state.lock().await;
        state
            .tasks
            .values()
            .filter(|t| t.is_visible_in_zones(&self.config.zone_ids))
            .filter(|t| filter(&state, t))
            .take(limit)
            .map(TaskState::info)
            .collect()
    }

    async fn list_stalling(
        &self,
        status: TaskStatus,
        excluding_host: &str,
        limit: usize,
        task_types: &[String],
    ) -> Vec<TaskInfo> {
        let now = self.clock.now();
        let timeout = self.config.task_stalling_timeout;
        self.list(limit, |_, t| {
            t.status == status
                && t.lease_deadline(timeout) <= now
                && t.last_host != excluding_host
                && Self::whitelisted(task_types, t)
        })
        .await
    }

    async fn lock_task(
        &self,
        info: &TaskInfo,
        at: DateTime<Utc>,
        host: &str,
        runner: &str,
        claimable: [TaskStatus; 2],
        target: TaskStatus,
    ) -> Result<TaskState> {
        let mut state = self.state.lock().await;
        let task = state.get_mut(info.id)?;

        if task.generation_id != info.generation_id {
            return Err(TaskError::WrongGeneration);
        }
        if !claimable.contains(&task.status) {
            return Err(TaskError::non_retriable(format!(
                "invalid status {} of task {} for {}",
                task.status, info.id, target
            )));
        }

        if task.status != target {
            task.status = target;
            task.changed_state_at = at;
        }
        task.generation_id += 1;
        task.modified_at = at;
        task.last_host = host.to_string();
        task.last_runner = runner.to_string();
        Ok(task.clone())
    }

    async fn set_paused(&self, id: TaskId, paused: bool) -> Result<()> {
        let (from, to) = if paused {
            (TaskStatus::ReadyToRun, TaskStatus::WaitingToRun)
        } else {
            (TaskStatus::WaitingToRun, TaskStatus::ReadyToRun)
        };
        let now = self.clock.now();

        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        if task.status == to {
            return Ok(());
        }
        if task.status != from {
            return Err(TaskError::non_retriable(format!(
                "invalid status {} of task {id}",
                task.status
            )));
        }
        task.status = to;
        task.generation_id += 1;
        task.changed_state_at = now;
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_task(&self, task: TaskState) -> Result<TaskId> {
        let mut state = self.state.lock().await;

        if !task.idempotency_key.is_empty() {
            let key = (task.idempotency_key.clone(), task.account_id.clone());
            if let Some(existing) = state.idempotency.get(&key) {
                return Ok(*existing);
            }
        }

        let task_type = task.task_type.clone();
        let id = state.insert_new(self.ids.generate_task_id(), task);
        self.metrics.on_created(&task_type, 1);
        Ok(id)
    }

    async fn create_regular_tasks(
        &self,
        template: TaskState,
        schedule: TaskSchedule,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let due = match state.schedules.get(&template.task_type) {
            None => true,
            Some(s) => {
                s.tasks_inflight == 0
                    && template.created_at >= s.scheduled_at + to_chrono(schedule.schedule_interval)
            }
        };
        if !due {
            return Ok(());
        }

        for _ in 0..schedule.max_tasks_inflight {
            let mut task = template.clone();
            task.regular = true;
            task.idempotency_key.clear();
            state.insert_new(self.ids.generate_task_id(), task);
        }
        state.schedules.insert(
            template.task_type.clone(),
            Schedule {
                task_type: template.task_type.clone(),
                scheduled_at: template.created_at,
                tasks_inflight: schedule.max_tasks_inflight,
            },
        );
        if schedule.max_tasks_inflight > 0 {
            self.metrics
                .on_created(&template.task_type, schedule.max_tasks_inflight);
        }
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<TaskState> {
        if id.is_nil() {
            return Err(TaskError::not_found(id));
        }
        let state = self.state.lock().await;
        state.get(id).cloned()
    }

    async fn get_task_by_idempotency_key(
        &self,
        idempotency_key: &str,
        account_id: &str,
    ) -> Result<TaskState> {
        let state = self.state.lock().await;
        let key = (idempotency_key.to_string(), account_id.to_string());
        let id = state
            .idempotency
            .get(&key)
            .copied()
            .ok_or_else(|| TaskError::not_found(format!("idempotency_key={idempotency_key}")))?;
        state.get(id).cloned()
    }

    async fn list_tasks_ready_to_run(
        &self,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list(limit, |state, t| {
                t.status == TaskStatus::ReadyToRun
                    && t.dependencies.iter().all(|dep| state.is_resolved(dep))
                    && Self::whitelisted(task_types, t)
            })
            .await)
    }

    async fn list_tasks_ready_to_cancel(
        &self,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list(limit, |_, t| {
                t.status == TaskStatus::ReadyToCancel && Self::whitelisted(task_types, t)
            })
            .await)
    }

    async fn list_tasks_stalling_while_running(
        &self,
        excluding_host: &str,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list_stalling(TaskStatus::Running, excluding_host, limit, task_types)
            .await)
    }

    async fn list_tasks_stalling_while_cancelling(
        &self,
        excluding_host: &str,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list_stalling(TaskStatus::Cancelling, excluding_host, limit, task_types)
            .await)
    }

    async fn list_tasks_running(&self, limit: usize) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list(limit, |_, t| t.status == TaskStatus::Running)
            .await)
    }

    async fn list_tasks_cancelling(&self, limit: usize) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list(limit, |_, t| t.status == TaskStatus::Cancelling)
            .await)
    }

    async fn list_failed_tasks(&self, since: DateTime<Utc>) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list(usize::MAX, |_, t| {
                t.status.is_cancelling()
                    && !matches!(t.error_code, ErrorCode::Ok | ErrorCode::Cancelled)
                    && !t.error_silent
                    && t.changed_state_at >= since
            })
            .await)
    }

    async fn list_slow_tasks(
        &self,
        since: DateTime<Utc>,
        estimate_miss: Duration,
    ) -> Result<Vec<TaskInfo>> {
        let miss = to_chrono(estimate_miss);
        Ok(self
            .list(usize::MAX, |_, t| {
                t.status == TaskStatus::Finished
                    && t.created_at >= since
                    && matches!(
                        (t.estimated_time, t.ended_at),
                        (Some(estimated), Some(ended)) if ended - estimated >= miss
                    )
            })
            .await)
    }

    async fn lock_task_to_run(
        &self,
        info: &TaskInfo,
        at: DateTime<Utc>,
        host: &str,
        runner: &str,
    ) -> Result<TaskState> {
        self.lock_task(
            info,
            at,
            host,
            runner,
            [TaskStatus::ReadyToRun, TaskStatus::Running],
            TaskStatus::Running,
        )
        .await
    }

    async fn lock_task_to_cancel(
        &self,
        info: &TaskInfo,
        at: DateTime<Utc>,
        host: &str,
        runner: &str,
    ) -> Result<TaskState> {
        self.lock_task(
            info,
            at,
            host,
            runner,
            [TaskStatus::ReadyToCancel, TaskStatus::Cancelling],
            TaskStatus::Cancelling,
        )
        .await
    }

    async fn mark_for_cancellation(&self, id: TaskId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        let status = task.status;

        match status {
            TaskStatus::ReadyToRun | TaskStatus::WaitingToRun | TaskStatus::Running => {
                task.status = TaskStatus::ReadyToCancel;
                task.generation_id += 1;
                task.modified_at = at;
                task.changed_state_at = at;
                task.error_code = ErrorCode::Cancelled;
                task.error_message = "Cancelled by client".to_string();
                state.propagate_resolution(id, at);
                Ok(true)
            }
            TaskStatus::ReadyToCancel | TaskStatus::Cancelling | TaskStatus::Cancelled => Ok(true),
            TaskStatus::Finished => Ok(false),
        }
    }

    async fn update_task(&self, mut task: TaskState) -> Result<TaskState> {
        let mut state = self.state.lock().await;
        let id = task.id;
        let stored = state.get(id)?;

        if stored.generation_id != task.generation_id {
            return Err(TaskError::WrongGeneration);
        }

        let prev_status = stored.status;
        let prev_deps = stored.dependencies.clone();
        task.idempotency_key = stored.idempotency_key.clone();
        task.account_id = stored.account_id.clone();
        task.task_type = stored.task_type.clone();
        task.regular = stored.regular;
        task.created_at = stored.created_at;
        task.events = stored.events.clone();
        task.dependants = stored.dependants.clone();

        let status_changed = task.status != prev_status;
        if status_changed {
            task.generation_id += 1;
            task.changed_state_at = task.modified_at;
            if task.status.is_ended() && task.ended_at.is_none() {
                task.ended_at = Some(task.modified_at);
            }
        } else {
            task.changed_state_at = stored.changed_state_at;
        }

        state.prune_resolved(&mut task.dependencies);
        for added in task.dependencies.difference(&prev_deps) {
            state.add_dependant(*added, id);
        }
        for removed in prev_deps.difference(&task.dependencies) {
            state.remove_dependant(*removed, id);
        }

        let entered_ended = status_changed && task.status.is_ended() && !prev_status.is_ended();
        if entered_ended && task.regular {
            if let Some(schedule) = state.schedules.get_mut(&task.task_type) {
                schedule.tasks_inflight = schedule.tasks_inflight.saturating_sub(1);
            }
        }
        if status_changed && task.status == TaskStatus::Finished {
            self.metrics.on_finished(&task);
        }

        let resolves = task.status.resolves_dependants() && !prev_status.resolves_dependants();
        let modified_at = task.modified_at;
        state.tasks.insert(id, task);
        if resolves {
            state.propagate_resolution(id, modified_at);
        }

        state.get(id).cloned()
    }

    async fn send_event(&self, id: TaskId, event: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        if !task.events.contains(&event) {
            task.events.push(event);
        }
        Ok(())
    }

    async fn clear_ended_tasks(
        &self,
        ended_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_ended() && t.ended_at.is_some_and(|e| e < ended_before))
            .take(limit)
            .map(|t| t.id)
            .collect();

        for id in &expired {
            state.remove(*id);
        }
        Ok(expired.len())
    }

    async fn pause_task(&self, id: TaskId) -> Result<()> {
        self.set_paused(id, true).await
    }

    async fn resume_task(&self, id: TaskId) -> Result<()> {
        self.set_paused(id, false).await
    }

    async fn heartbeat(
        &self,
        host: &str,
        at: DateTime<Utc>,
        inflight_task_count: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.nodes.insert(
            host.to_string(),
            Node {
                host: host.to_string(),
                last_heartbeat: at,
                inflight_task_count,
            },
        );
        Ok(())
    }

    async fn get_alive_nodes(&self) -> Result<Vec<Node>> {
        let now = self.clock.now();
        let timeout = to_chrono(self.config.node_liveness_timeout);
        let state = self.state.lock().await;
        let mut nodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|n| now - n.last_heartbeat < timeout)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(nodes)
    }

    async fn get_node(&self, host: &str) -> Result<Node> {
        let state = self.state.lock().await;
        state
            .nodes
            .get(host)
            .cloned()
            .ok_or_else(|| TaskError::non_retriable(format!("no node with host={host}")))
    }
}
