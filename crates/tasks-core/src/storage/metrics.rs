use std::sync::Arc;

use crate::domain::TaskState;
use crate::ports::MetricsRegistry;

/// Series emitted by storage on task creation and completion.
#[derive(Clone)]
pub(crate) struct StorageMetrics {
    registry: Arc<dyn MetricsRegistry>,
}

impl StorageMetrics {
    pub(crate) fn new(registry: Arc<dyn MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub(crate) fn on_created(&self, task_type: &str, count: u64) {
        self.registry
            .counter_add("created", &[("type", task_type)], count);
    }

    /// Called once, when `state` has just entered `Finished`.
    pub(crate) fn on_finished(&self, state: &TaskState) {
        let Some(ended_at) = state.ended_at else {
            return;
        };
        let tags = [("type", state.task_type.as_str())];

        if let Ok(total) = (ended_at - state.created_at).to_std() {
            self.registry.record_duration("time/total", &tags, total);
        }

        if let Some(estimated) = state.estimated_time
            && state.created_at < estimated
            && estimated < ended_at
            && let Ok(miss) = (ended_at - estimated).to_std()
        {
            self.registry.record_duration("time/estimateMiss", &tags, miss);
        }
    }
}
