//! Built-in tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::execution_context::ExecutionContext;
use crate::domain::Result;
use crate::domain::task::to_chrono;
use crate::ports::{Clock, Storage};
use crate::typed::{Task, TaskType};

/// Does nothing. Handy as a dependency placeholder and for smoke checks.
#[derive(Debug, Default)]
pub struct BlankTask;

#[async_trait]
impl Task for BlankTask {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, _request: &[u8], _state: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl TaskType for BlankTask {
    const TYPE: &'static str = "tasks.Blank";
}

/// Purges ended tasks older than `expiration`. Scheduled as a regular task
/// by the engine.
pub(crate) struct ClearEndedTasks {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    expiration: Duration,
    limit: usize,
}

impl ClearEndedTasks {
    pub(crate) const TYPE: &'static str = "tasks.ClearEndedTasks";

    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        expiration: Duration,
        limit: usize,
    ) -> Self {
        Self {
            storage,
            clock,
            expiration,
            limit,
        }
    }
}

#[async_trait]
impl Task for ClearEndedTasks {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, _request: &[u8], _state: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        let ended_before = self.clock.now() - to_chrono(self.expiration);
        let removed = self
            .storage
            .clear_ended_tasks(ended_before, self.limit)
            .await?;
        if removed > 0 {
            info!(removed, %ended_before, "cleared ended tasks");
        }
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskState, TaskStatus};
    use crate::testing::Harness;
    use tokio_util::sync::CancellationToken;

    async fn exec_for(h: &Harness, task_type: &str) -> ExecutionContext {
        let id = h
            .storage
            .create_task(TaskState::new(task_type, h.clock.now()))
            .await
            .unwrap();
        let info = h.storage.get_task(id).await.unwrap().info();
        let locked = h
            .storage
            .lock_task_to_run(&info, h.clock.now(), "host", "runner")
            .await
            .unwrap();
        ExecutionContext::new(
            locked,
            h.storage.clone(),
            h.clock.clone(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn clear_ended_tasks_purges_only_expired() {
        let h = Harness::new();

        let mut old = TaskState::new("t", h.clock.now());
        old.status = TaskStatus::Finished;
        old.ended_at = Some(h.clock.now());
        let old = h.storage.create_task(old).await.unwrap();

        h.clock.advance(Duration::from_secs(2 * 60 * 60));
        let mut fresh = TaskState::new("t", h.clock.now());
        fresh.status = TaskStatus::Cancelled;
        fresh.ended_at = Some(h.clock.now());
        let fresh = h.storage.create_task(fresh).await.unwrap();
        let pending = h
            .storage
            .create_task(TaskState::new("t", h.clock.now()))
            .await
            .unwrap();

        let exec = exec_for(&h, ClearEndedTasks::TYPE).await;
        let mut task = ClearEndedTasks::new(
            h.storage.clone(),
            h.clock.clone(),
            Duration::from_secs(60 * 60),
            100,
        );
        task.run(&exec).await.unwrap();

        assert!(h.storage.get_task(old).await.unwrap_err().is_not_found());
        assert!(h.storage.get_task(fresh).await.is_ok());
        assert!(h.storage.get_task(pending).await.is_ok());
    }

    #[tokio::test]
    async fn blank_task_is_a_no_op() {
        let h = Harness::new();
        let exec = exec_for(&h, BlankTask::TYPE).await;
        let mut task = BlankTask;
        task.load(b"ignored", b"").await.unwrap();
        task.run(&exec).await.unwrap();
        task.cancel(&exec).await.unwrap();
        assert!(task.save().unwrap().is_empty());
    }
}
