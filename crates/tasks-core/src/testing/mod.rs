//! Shared test fixtures.

pub(crate) mod tasks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::TasksConfig;
use crate::ports::{FixedClock, InMemoryMetrics, UlidGenerator};
use crate::storage::{InMemoryStorage, StorageConfig};
use crate::typed::TaskType;

pub(crate) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// In-memory storage on a frozen clock.
pub(crate) struct Harness {
    pub(crate) storage: Arc<InMemoryStorage>,
    pub(crate) clock: Arc<FixedClock>,
    pub(crate) metrics: Arc<InMemoryMetrics>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let clock = Arc::new(FixedClock::new(start()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let storage = Arc::new(InMemoryStorage::new(
            StorageConfig::from(&test_config()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            metrics.clone(),
        ));
        Self {
            storage,
            clock,
            metrics,
        }
    }
}

/// Short periods so end-to-end scenarios settle in well under a second each.
pub(crate) fn test_config() -> TasksConfig {
    TasksConfig {
        runners_count: 5,
        stalking_runners_count: 2,
        poll_for_task_updates_period: Duration::from_millis(50),
        poll_for_tasks_period_min: Duration::from_millis(100),
        poll_for_tasks_period_max: Duration::from_millis(200),
        poll_for_stalling_tasks_period_min: Duration::from_millis(100),
        poll_for_stalling_tasks_period_max: Duration::from_millis(400),
        task_ping_period: Duration::from_millis(100),
        task_stalling_timeout: Duration::from_secs(1),
        task_waiting_timeout: Duration::from_millis(500),
        schedule_regular_tasks_period_min: Duration::from_millis(100),
        schedule_regular_tasks_period_max: Duration::from_millis(400),
        max_retriable_error_count: 2,
        hanging_task_check_period: Duration::from_millis(100),
        heartbeat_period: Duration::from_millis(100),
        inflight_task_per_node_limits: HashMap::from([(tasks::LongTask::TYPE.to_string(), 1)]),
        ..TasksConfig::default()
    }
}
