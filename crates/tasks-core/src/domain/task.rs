use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::errors::{ErrorCode, ErrorDetails, TaskError};
use super::status::TaskStatus;
use super::TaskId;

/// Durable record of one unit of work.
///
/// `request` and `state` are opaque to the engine: only the factory registered
/// for `task_type` can interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Assigned by storage; whatever the caller puts here is ignored on create.
    pub id: TaskId,
    pub idempotency_key: String,
    pub account_id: String,
    pub task_type: String,
    pub regular: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    /// Last lease renewal. The lease expires `task_stalling_timeout` later.
    pub modified_at: DateTime<Utc>,
    pub generation_id: u64,
    pub status: TaskStatus,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub error_silent: bool,
    pub error_details: Option<ErrorDetails>,
    pub retriable_error_count: u64,
    pub panic_count: u64,
    pub request: Vec<u8>,
    pub state: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub dependencies: BTreeSet<TaskId>,
    /// Reverse edge of `dependencies`, owned by storage.
    pub(crate) dependants: BTreeSet<TaskId>,
    pub changed_state_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_host: String,
    pub last_runner: String,
    pub zone_id: String,
    pub cloud_id: String,
    pub folder_id: String,
    pub estimated_time: Option<DateTime<Utc>>,
    /// Owned by `send_event`; `update_task` never writes it.
    pub events: Vec<i64>,
}

impl TaskState {
    /// Fresh `ReadyToRun` record of the given type, created at `now`.
    pub fn new(task_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::nil(),
            idempotency_key: String::new(),
            account_id: String::new(),
            task_type: task_type.into(),
            regular: false,
            description: String::new(),
            created_at: now,
            created_by: String::new(),
            modified_at: now,
            generation_id: 0,
            status: TaskStatus::ReadyToRun,
            error_code: ErrorCode::Ok,
            error_message: String::new(),
            error_silent: false,
            error_details: None,
            retriable_error_count: 0,
            panic_count: 0,
            request: Vec::new(),
            state: Vec::new(),
            metadata: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            dependants: BTreeSet::new(),
            changed_state_at: now,
            ended_at: None,
            last_host: String::new(),
            last_runner: String::new(),
            zone_id: String::new(),
            cloud_id: String::new(),
            folder_id: String::new(),
            estimated_time: None,
            events: Vec::new(),
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            generation_id: self.generation_id,
            task_type: self.task_type.clone(),
        }
    }

    /// Tasks that still wait on dependencies are reported as `WaitingToRun`.
    pub fn effective_status(&self) -> TaskStatus {
        if self.status == TaskStatus::ReadyToRun && !self.dependencies.is_empty() {
            TaskStatus::WaitingToRun
        } else {
            self.status
        }
    }

    pub fn dependants(&self) -> &BTreeSet<TaskId> {
        &self.dependants
    }

    pub fn has_error(&self) -> bool {
        self.error_code != ErrorCode::Ok
    }

    /// Records `err` as the task's terminal error.
    pub fn set_error(&mut self, err: &TaskError) {
        self.error_code = err.code();
        self.error_message = err.to_string();
        self.error_silent = err.is_silent();
        self.error_details = err.details().cloned();
    }

    /// Stored error as a structured failure, if any.
    pub fn error(&self) -> Option<TaskError> {
        if !self.has_error() {
            return None;
        }
        Some(TaskError::Failed {
            code: self.error_code,
            message: self.error_message.clone(),
            details: self.error_details.clone(),
        })
    }

    /// Lease deadline derived from the last renewal.
    pub fn lease_deadline(&self, stalling_timeout: Duration) -> DateTime<Utc> {
        self.modified_at + to_chrono(stalling_timeout)
    }

    pub fn is_visible_in_zones(&self, zone_ids: &[String]) -> bool {
        self.zone_id.is_empty() || zone_ids.is_empty() || zone_ids.contains(&self.zone_id)
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Listing projection of a task: enough to attempt a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub generation_id: u64,
    pub task_type: String,
}

/// Submission identity, normally taken from incoming request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub idempotency_key: String,
    pub account_id: String,
    pub created_by: String,
}

impl RequestContext {
    pub fn new(idempotency_key: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            ..Self::default()
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_user(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }
}
