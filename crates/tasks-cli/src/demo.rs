//! デモ用タスク
//!
//! - `demo.Double`: 数値を 2 倍にする
//! - `demo.Flaky`: 指定回数だけ retriable エラーで失敗してから成功する
//! - `demo.Fanout`: Double を複数投入し、全部待って合計する（依存関係のデモ）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use tasks_core::typed::codec;
use tasks_core::{ExecutionContext, RequestContext, Result, Scheduler, Task, TaskError, TaskType};

#[derive(Default)]
pub struct DoubleTask {
    value: i64,
    result: Option<i64>,
}

#[async_trait]
impl Task for DoubleTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.result)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.value = codec::decode(request)?;
        self.result = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        self.result = Some(self.value * 2);
        info!(task_id = %exec.get_task_id(), value = self.value, "doubled");
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!(self.result)
    }
}

impl TaskType for DoubleTask {
    const TYPE: &'static str = "demo.Double";
}

#[derive(Default, Serialize, Deserialize)]
struct FlakyProgress {
    attempts: u32,
}

#[derive(Default)]
pub struct FlakyTask {
    failures: u32,
    progress: FlakyProgress,
}

#[async_trait]
impl Task for FlakyTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.progress)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.failures = codec::decode(request)?;
        self.progress = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        self.progress.attempts += 1;
        exec.save_state(self.save()?).await?;
        if self.progress.attempts <= self.failures {
            return Err(TaskError::retriable(format!(
                "attempt {} of flaky task failed",
                self.progress.attempts
            )));
        }
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!({ "attempts": self.progress.attempts })
    }
}

impl TaskType for FlakyTask {
    const TYPE: &'static str = "demo.Flaky";
}

pub struct FanoutTask {
    scheduler: Scheduler,
    values: Vec<i64>,
    sum: Option<i64>,
}

impl FanoutTask {
    pub const TYPE: &'static str = "demo.Fanout";

    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            values: Vec::new(),
            sum: None,
        }
    }
}

#[async_trait]
impl Task for FanoutTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.sum)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.values = codec::decode(request)?;
        self.sum = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        let mut sum = 0;
        for (i, value) in self.values.iter().enumerate() {
            // same key on every attempt, so a resumed run finds the same children
            let ctx = RequestContext::new(format!("{}/{i}", exec.get_task_id()));
            let child = self
                .scheduler
                .schedule_task(&ctx, DoubleTask::TYPE, "fanout child", value, "", "")
                .await?;
            let doubled: i64 = serde_json::from_value(self.scheduler.wait_task(exec, child).await?)?;
            sum += doubled;
        }
        self.sum = Some(sum);
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!(self.sum)
    }
}
