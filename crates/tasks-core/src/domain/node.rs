use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Liveness record refreshed by every worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub last_heartbeat: DateTime<Utc>,
    pub inflight_task_count: u32,
}

/// Per-type bookkeeping for regular tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub task_type: String,
    pub scheduled_at: DateTime<Utc>,
    pub tasks_inflight: u64,
}

/// How often a regular task is re-created and how many instances run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSchedule {
    pub schedule_interval: Duration,
    pub max_tasks_inflight: u64,
}

impl TaskSchedule {
    pub fn every(schedule_interval: Duration, max_tasks_inflight: u64) -> Self {
        Self {
            schedule_interval,
            max_tasks_inflight,
        }
    }
}
