//! Caller-facing projection of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorCode, ErrorDetails};
use super::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: TaskId,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub modified_at: DateTime<Utc>,
    pub done: bool,
    pub metadata: serde_json::Value,
    /// Response once finished, error once cancelling. `None` otherwise.
    pub result: Option<OperationResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResult {
    Response(serde_json::Value),
    Error {
        code: ErrorCode,
        message: String,
        details: Option<ErrorDetails>,
    },
}
