use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::domain::TaskError;
use crate::ports::MetricsRegistry;

const HANGING_LOG_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Counters and gauges reported by runners, plus the shared rate limiter for
/// hanging-task warnings.
#[derive(Clone)]
pub(crate) struct RunnerMetrics {
    registry: Arc<dyn MetricsRegistry>,
    last_hanging_log: Arc<Mutex<Option<Instant>>>,
}

impl RunnerMetrics {
    pub(crate) fn new(registry: Arc<dyn MetricsRegistry>) -> Self {
        Self {
            registry,
            last_hanging_log: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn on_execution_started(&self, task_type: &str) {
        self.registry
            .gauge_add("inflightTasks", &[("type", task_type)], 1);
    }

    pub(crate) fn on_execution_stopped(&self, task_type: &str) {
        self.registry
            .gauge_add("inflightTasks", &[("type", task_type)], -1);
    }

    pub(crate) fn on_hanging(&self, task_type: &str, delta: i64) {
        self.registry
            .gauge_add("hangingTasks", &[("type", task_type)], delta);
    }

    /// True at most once per cooldown across the whole pool.
    pub(crate) fn should_log_hanging(&self) -> bool {
        let mut last = self
            .last_hanging_log
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < HANGING_LOG_COOLDOWN => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub(crate) fn on_error(&self, task_type: &str, err: &TaskError) {
        let name = match err.root() {
            TaskError::Retriable { .. } => "errors/retriable",
            TaskError::NonRetriable { silent: true, .. } => return,
            TaskError::NonRetriable { .. } => "errors/nonRetriable",
            TaskError::NonCancellable { .. } => "errors/nonCancellable",
            TaskError::WrongGeneration => "errors/wrongGeneration",
            TaskError::Panic { .. } => "errors/panic",
            TaskError::InterruptExecution => return,
            _ => "errors/other",
        };
        self.registry.counter_add(name, &[("type", task_type)], 1);
    }
}
