//! EngineBuilder - engine の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - `expect_tasks()` で期待される task_type を登録
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」と config の妥当性をチェック
//! - 不足があれば `BuildError` を返す
//!
//! storage / clock / metrics は差し替え可能で、指定しなければ
//! in-memory storage, システム時計, no-op メトリクスになります。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runner::{Inflight, RunnerContext, spawn_runners};
use super::runner_metrics::RunnerMetrics;
use super::scheduler::Scheduler;
use super::tasks::{BlankTask, ClearEndedTasks};
use crate::config::{ConfigError, TasksConfig};
use crate::domain::TaskSchedule;
use crate::ports::{
    Clock, IdGenerator, MetricsRegistry, NoopMetrics, Storage, SystemClock, UlidGenerator,
};
use crate::storage::{InMemoryStorage, StorageConfig};
use crate::typed::{Registry, RegistryError, Task, TaskType};

type SchedulerFactory = Box<dyn Fn(&Scheduler) -> Box<dyn Task> + Send + Sync>;

/// BuildError は engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("expected task types are not registered: {0:?}")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// # 使用例
/// ```ignore
/// let mut engine = EngineBuilder::new()
///     .config(config)
///     .register_typed_for_execution::<MyTask>()?
///     .expect_tasks(&[MyTask::TYPE])
///     .build()?;
/// engine.start();
/// ```
pub struct EngineBuilder {
    config: TasksConfig,
    host: String,
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRegistry>,
    registry: Registry,
    deferred: Vec<(String, SchedulerFactory)>,
    expected_tasks: Option<Vec<String>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: TasksConfig::default(),
            host: "localhost".to_string(),
            storage: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
            registry: Registry::new(),
            deferred: Vec::new(),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: TasksConfig) -> Self {
        self.config = config;
        self
    }

    /// Name this process reports in heartbeats and lock records.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn register<F>(self, task_type: &str, factory: F) -> Result<Self, RegistryError>
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.registry.register(task_type, factory)?;
        Ok(self)
    }

    pub fn register_for_execution<F>(self, task_type: &str, factory: F) -> Result<Self, RegistryError>
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.registry.register_for_execution(task_type, factory)?;
        Ok(self)
    }

    pub fn register_typed<T: TaskType>(self) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T>()?;
        Ok(self)
    }

    pub fn register_typed_for_execution<T: TaskType>(self) -> Result<Self, RegistryError> {
        self.registry.register_typed_for_execution::<T>()?;
        Ok(self)
    }

    /// For tasks that schedule or wait on other tasks. The factory receives
    /// the engine's scheduler once it exists.
    pub fn register_for_execution_with<F>(mut self, task_type: &str, factory: F) -> Self
    where
        F: Fn(&Scheduler) -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.deferred.push((task_type.to_string(), Box::new(factory)));
        self
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(InMemoryStorage::new(
                StorageConfig::from(config.as_ref()),
                Arc::clone(&self.clock),
                Arc::clone(&ids),
                Arc::clone(&self.metrics),
            )),
        };

        let shutdown = CancellationToken::new();
        let registry = self.registry;
        let scheduler = Scheduler::new(
            Arc::clone(&storage),
            registry.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&config),
            shutdown.clone(),
        );

        for (task_type, factory) in self.deferred {
            let scheduler = scheduler.clone();
            registry.register_for_execution(&task_type, move || factory(&scheduler))?;
        }

        let registered = registry.registered_types();
        if !registered.iter().any(|t| t == BlankTask::TYPE) {
            registry.register_typed_for_execution::<BlankTask>()?;
        }
        if !registered.iter().any(|t| t == ClearEndedTasks::TYPE) {
            let (storage, clock) = (Arc::clone(&storage), Arc::clone(&self.clock));
            let (expiration, limit) = (
                config.ended_task_expiration_timeout,
                config.clear_ended_tasks_limit,
            );
            registry.register_for_execution(ClearEndedTasks::TYPE, move || {
                Box::new(ClearEndedTasks::new(
                    Arc::clone(&storage),
                    Arc::clone(&clock),
                    expiration,
                    limit,
                ))
            })?;
        }

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered = registry.registered_types();
            let missing: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        let runners = RunnerContext {
            storage: Arc::clone(&storage),
            registry: registry.clone(),
            clock: self.clock,
            config,
            host: self.host,
            metrics: RunnerMetrics::new(self.metrics),
            inflight: Arc::new(Inflight::default()),
            shutdown: shutdown.clone(),
        };

        Ok(Engine {
            scheduler,
            storage,
            registry,
            ids,
            runners,
            shutdown,
            joins: Vec::new(),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine は runner 群と scheduler をまとめたもの
///
/// - `start()` で runner, heartbeat, ClearEndedTasks の定期投入を開始
/// - `shutdown_and_join()` で root token を cancel し、全ループの終了を待つ
pub struct Engine {
    scheduler: Scheduler,
    storage: Arc<dyn Storage>,
    registry: Registry,
    ids: Arc<dyn IdGenerator>,
    runners: RunnerContext,
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Idempotent.
    pub fn start(&mut self) {
        if !self.joins.is_empty() {
            return;
        }
        self.joins = spawn_runners(&self.runners, self.ids.as_ref());

        let config = &self.runners.config;
        self.scheduler.schedule_regular_tasks(
            ClearEndedTasks::TYPE,
            "Clear ended tasks",
            TaskSchedule::every(config.clear_ended_tasks_task_schedule_interval, 1),
        );
        info!(host = %self.runners.host, types = ?self.registry.task_types_for_execution(), "engine started");
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Cancels the root token. Running tasks observe it through their
    /// execution context.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let background = self.scheduler.take_background();
        for join in self.joins.into_iter().chain(background) {
            if let Err(err) = join.await {
                warn!(error = %err, "engine loop exited abnormally");
            }
        }
        info!(host = %self.runners.host, "engine stopped");
    }
}
