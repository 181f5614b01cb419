//! Registry - task_type ごとの factory 管理
//!
//! # 二つのテーブル
//! - `register`: この process で decode できる（状態の参照、メタデータ取得など）
//! - `register_for_execution`: decode に加えて、この process の runner が実行する
//!
//! runner の poll は実行用テーブルの task_type だけを listing します。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::task::{Task, TaskType};
use crate::domain::{Result, TaskError};

pub type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Factory for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
struct Tables {
    factories: HashMap<String, TaskFactory>,
    executable: BTreeSet<String>,
}

/// Registry は clone しても同じテーブルを共有します。
#[derive(Clone, Default)]
pub struct Registry {
    tables: Arc<RwLock<Tables>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(
        &self,
        task_type: &str,
        factory: TaskFactory,
        executable: bool,
    ) -> Result<(), RegistryError> {
        let mut tables = self.write();
        if tables.factories.contains_key(task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type.to_string()));
        }
        tables.factories.insert(task_type.to_string(), factory);
        if executable {
            tables.executable.insert(task_type.to_string());
        }
        Ok(())
    }

    pub fn register<F>(&self, task_type: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.insert(task_type, Arc::new(factory), false)
    }

    pub fn register_for_execution<F>(
        &self,
        task_type: &str,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.insert(task_type, Arc::new(factory), true)
    }

    /// `T::default()` を factory として登録
    pub fn register_typed<T: TaskType>(&self) -> Result<(), RegistryError> {
        self.register(T::TYPE, || Box::new(T::default()))
    }

    pub fn register_typed_for_execution<T: TaskType>(&self) -> Result<(), RegistryError> {
        self.register_for_execution(T::TYPE, || Box::new(T::default()))
    }

    /// Fresh, not yet loaded instance of `task_type`.
    pub fn new_task(&self, task_type: &str) -> Result<Box<dyn Task>> {
        let factory = self
            .read()
            .factories
            .get(task_type)
            .cloned()
            .ok_or_else(|| {
                TaskError::non_retriable(format!("Task factory of type {task_type} is missing"))
            })?;
        Ok(factory())
    }

    /// Same as `new_task`, but refuses types this process must not execute.
    pub fn new_task_for_execution(&self, task_type: &str) -> Result<Box<dyn Task>> {
        if !self.is_executable(task_type) {
            return Err(TaskError::non_retriable(format!(
                "Task of type {task_type} is not registered for execution"
            )));
        }
        self.new_task(task_type)
    }

    pub fn is_executable(&self, task_type: &str) -> bool {
        self.read().executable.contains(task_type)
    }

    /// Sorted.
    pub fn task_types_for_execution(&self) -> Vec<String> {
        self.read().executable.iter().cloned().collect()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tasks::BlankTask;

    fn blank() -> Box<dyn Task> {
        Box::new(BlankTask)
    }

    #[test]
    fn register_then_create() {
        let registry = Registry::new();
        registry.register("decode.only", blank).unwrap();

        assert!(registry.new_task("decode.only").is_ok());
        assert_eq!(registry.registered_types(), vec!["decode.only".to_string()]);
        assert!(registry.task_types_for_execution().is_empty());
    }

    #[test]
    fn double_registration_fails_across_tables() {
        let registry = Registry::new();
        registry.register("t", blank).unwrap();

        let again = registry.register("t", blank);
        assert!(matches!(again, Err(RegistryError::AlreadyRegistered(t)) if t == "t"));

        let for_execution = registry.register_for_execution("t", blank);
        assert!(matches!(for_execution, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn execution_guard_rejects_decode_only_types() {
        let registry = Registry::new();
        registry.register("decode.only", blank).unwrap();
        registry.register_typed_for_execution::<BlankTask>().unwrap();

        let err = registry.new_task_for_execution("decode.only").err().unwrap();
        assert!(err.is_non_retriable());

        assert!(registry.new_task_for_execution(BlankTask::TYPE).is_ok());
        assert_eq!(
            registry.task_types_for_execution(),
            vec![BlankTask::TYPE.to_string()]
        );
    }

    #[test]
    fn unknown_type_is_non_retriable() {
        let registry = Registry::new();
        let err = registry.new_task("nope").err().unwrap();
        assert!(err.is_non_retriable());
    }

    #[test]
    fn clones_share_tables() {
        let registry = Registry::new();
        let clone = registry.clone();
        clone.register_typed::<BlankTask>().unwrap();
        assert!(registry.new_task(BlankTask::TYPE).is_ok());
    }
}
