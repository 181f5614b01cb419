//! Tasks used by the end-to-end engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::app::{ExecutionContext, Scheduler};
use crate::domain::{RequestContext, Result, TaskError};
use crate::typed::{Task, TaskType, codec};

/// 123 -> 246.
#[derive(Default)]
pub(crate) struct DoublerTask {
    request: i64,
    response: Option<i64>,
}

#[async_trait]
impl Task for DoublerTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.response)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.request = codec::decode(request)?;
        self.response = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        self.response = Some(self.request * 2);
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!(self.response)
    }
}

impl TaskType for DoublerTask {
    const TYPE: &'static str = "doubler";
}

/// Sleeps for `request` milliseconds, or until its token is cancelled.
#[derive(Default)]
pub(crate) struct LongTask {
    millis: u64,
}

#[async_trait]
impl Task for LongTask {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, request: &[u8], _state: &[u8]) -> Result<()> {
        self.millis = codec::decode(request)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        tokio::select! {
            _ = exec.cancellation_token().cancelled() => Err(TaskError::InterruptExecution),
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => Ok(()),
        }
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl TaskType for LongTask {
    const TYPE: &'static str = "long";
}

pub(crate) const UNSTABLE_FAILURE: &str = "unstable task failed";

#[derive(Default, Serialize, Deserialize)]
struct UnstableState {
    attempts: u64,
}

/// Fails with a retriable error `request` times, then responds with the
/// number of failures it went through.
#[derive(Default)]
pub(crate) struct UnstableTask {
    failures: u64,
    state: UnstableState,
}

#[async_trait]
impl Task for UnstableTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.state)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.failures = codec::decode(request)?;
        self.state = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        self.state.attempts += 1;
        exec.save_state(self.save()?).await?;
        if self.state.attempts <= self.failures {
            return Err(TaskError::retriable(UNSTABLE_FAILURE));
        }
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!(self.state.attempts.saturating_sub(1))
    }
}

impl TaskType for UnstableTask {
    const TYPE: &'static str = "unstable";
}

/// Like `UnstableTask`, but its failures do not count against the retry limit.
#[derive(Default)]
pub(crate) struct StubbornTask {
    failures: u64,
    state: UnstableState,
}

#[async_trait]
impl Task for StubbornTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.state)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.failures = codec::decode(request)?;
        self.state = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        self.state.attempts += 1;
        exec.save_state(self.save()?).await?;
        if self.state.attempts <= self.failures {
            return Err(TaskError::retriable_ignoring_limit("stubborn task failed"));
        }
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!(self.state.attempts.saturating_sub(1))
    }
}

impl TaskType for StubbornTask {
    const TYPE: &'static str = "stubborn";
}

#[derive(Default)]
pub(crate) struct FailureTask;

#[async_trait]
impl Task for FailureTask {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, _request: &[u8], _state: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Err(TaskError::non_retriable("failure task always fails"))
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl TaskType for FailureTask {
    const TYPE: &'static str = "failure";
}

#[derive(Default)]
pub(crate) struct SilentFailureTask;

#[async_trait]
impl Task for SilentFailureTask {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, _request: &[u8], _state: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Err(TaskError::silent("expected failure"))
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl TaskType for SilentFailureTask {
    const TYPE: &'static str = "silentFailure";
}

/// What `BadCancelTask::cancel` does.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub(crate) enum CancelBehaviour {
    /// Retriable error on the first call, success afterwards.
    #[default]
    RetriableOnce,
    NonCancellable,
    Panic,
}

/// Always fails its run, so it lands on the cancel path. Counts cancel calls.
pub(crate) struct BadCancelTask {
    cancels: Arc<AtomicUsize>,
    behaviour: CancelBehaviour,
}

impl BadCancelTask {
    pub(crate) const TYPE: &'static str = "badCancel";

    pub(crate) fn new(cancels: Arc<AtomicUsize>) -> Self {
        Self {
            cancels,
            behaviour: CancelBehaviour::default(),
        }
    }
}

#[async_trait]
impl Task for BadCancelTask {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, request: &[u8], _state: &[u8]) -> Result<()> {
        self.behaviour = codec::decode(request)?;
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Err(TaskError::non_retriable("run always fails"))
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        let call = self.cancels.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behaviour {
            CancelBehaviour::RetriableOnce if call == 1 => {
                Err(TaskError::retriable("cleanup not ready"))
            }
            CancelBehaviour::RetriableOnce => Ok(()),
            CancelBehaviour::NonCancellable => Err(TaskError::non_cancellable("cannot be undone")),
            CancelBehaviour::Panic => panic!("cancel blows up"),
        }
    }
}

/// Panics on its first attempt only.
#[derive(Default)]
pub(crate) struct PanicTask {
    attempts: u64,
}

#[async_trait]
impl Task for PanicTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.attempts)
    }

    async fn load(&mut self, _request: &[u8], state: &[u8]) -> Result<()> {
        self.attempts = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        self.attempts += 1;
        exec.save_state(self.save()?).await?;
        if self.attempts == 1 {
            panic!("first attempt blows up");
        }
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl TaskType for PanicTask {
    const TYPE: &'static str = "panic";
}

/// Schedules a doubler keyed by its own id, waits for it and triples the
/// result: 123 -> 246 -> 738.
pub(crate) struct SixTimesTask {
    scheduler: Scheduler,
    request: i64,
    response: Option<i64>,
}

impl SixTimesTask {
    pub(crate) const TYPE: &'static str = "sixTimes";

    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            request: 0,
            response: None,
        }
    }
}

#[async_trait]
impl Task for SixTimesTask {
    fn save(&self) -> Result<Vec<u8>> {
        codec::encode(&self.response)
    }

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()> {
        self.request = codec::decode(request)?;
        self.response = codec::decode_or_default(state)?;
        Ok(())
    }

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()> {
        let ctx = RequestContext::new(exec.get_task_id().to_string());
        let id = self
            .scheduler
            .schedule_task(&ctx, DoublerTask::TYPE, "", &self.request, "", "")
            .await?;
        let doubled: i64 = serde_json::from_value(self.scheduler.wait_task(exec, id).await?)?;
        self.response = Some(doubled * 3);
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn get_response(&self) -> Value {
        json!(self.response)
    }
}

/// Counts its runs in a shared counter.
pub(crate) struct RegularTask {
    runs: Arc<AtomicUsize>,
}

impl RegularTask {
    pub(crate) const TYPE: &'static str = "regular";

    pub(crate) fn new(runs: Arc<AtomicUsize>) -> Self {
        Self { runs }
    }
}

#[async_trait]
impl Task for RegularTask {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn load(&mut self, _request: &[u8], _state: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _exec: &ExecutionContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&mut self, _exec: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}
