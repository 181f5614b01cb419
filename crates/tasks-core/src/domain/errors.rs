//! Errors - タスクのエラー分類
//!
//! Runner はこの分類だけを見てリトライ / 終了 / 中断を決めます。
//! - `Retriable`: リトライ上限まで再実行（`ignore_retry_limit` なら無制限）
//! - `NonRetriable`: 即座に失敗（`silent` ならアラート系メトリクスを抑制）
//! - `WrongGeneration`: CAS 競合。runner 内部で処理され、利用者には見えない
//! - `InterruptExecution`: 失敗ではない。`run` を途中で抜けるためのもの
//! - `Failed`: storage に保存された終了エラーを待機側に返すためのもの

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// gRPC 互換のエラーコード（レコードに保存される）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Caller-visible error annotation persisted next to `ErrorCode`/`ErrorMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    /// Internal errors are not shown verbatim to end users.
    pub internal: bool,
}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("retriable error: {message}")]
    Retriable {
        message: String,
        ignore_retry_limit: bool,
    },

    #[error("non retriable error: {message}")]
    NonRetriable { message: String, silent: bool },

    #[error("non cancellable error: {message}")]
    NonCancellable { message: String },

    #[error("wrong generation")]
    WrongGeneration,

    #[error("panic: {message}")]
    Panic { message: String },

    #[error("interrupt execution")]
    InterruptExecution,

    #[error("No task with id={id}")]
    NotFound { id: String },

    #[error("{source}")]
    Detailed {
        source: Box<TaskError>,
        details: ErrorDetails,
    },

    #[error("{message}")]
    Failed {
        code: ErrorCode,
        message: String,
        details: Option<ErrorDetails>,
    },
}

impl TaskError {
    pub fn retriable(message: impl fmt::Display) -> Self {
        Self::Retriable {
            message: message.to_string(),
            ignore_retry_limit: false,
        }
    }

    pub fn retriable_ignoring_limit(message: impl fmt::Display) -> Self {
        Self::Retriable {
            message: message.to_string(),
            ignore_retry_limit: true,
        }
    }

    pub fn non_retriable(message: impl fmt::Display) -> Self {
        Self::NonRetriable {
            message: message.to_string(),
            silent: false,
        }
    }

    pub fn silent(message: impl fmt::Display) -> Self {
        Self::NonRetriable {
            message: message.to_string(),
            silent: true,
        }
    }

    pub fn non_cancellable(message: impl fmt::Display) -> Self {
        Self::NonCancellable {
            message: message.to_string(),
        }
    }

    pub fn not_found(id: impl fmt::Display) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn with_details(self, details: ErrorDetails) -> Self {
        Self::Detailed {
            source: Box::new(self),
            details,
        }
    }

    /// Strips `Detailed` wrappers.
    pub fn root(&self) -> &TaskError {
        match self {
            TaskError::Detailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self.root(), TaskError::Retriable { .. })
    }

    pub fn ignores_retry_limit(&self) -> bool {
        matches!(
            self.root(),
            TaskError::Retriable {
                ignore_retry_limit: true,
                ..
            }
        )
    }

    pub fn is_non_retriable(&self) -> bool {
        matches!(self.root(), TaskError::NonRetriable { .. })
    }

    pub fn is_silent(&self) -> bool {
        matches!(self.root(), TaskError::NonRetriable { silent: true, .. })
    }

    pub fn is_wrong_generation(&self) -> bool {
        matches!(self.root(), TaskError::WrongGeneration)
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self.root(), TaskError::InterruptExecution)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), TaskError::NotFound { .. })
    }

    pub fn details(&self) -> Option<&ErrorDetails> {
        match self {
            TaskError::Detailed { details, .. } => Some(details),
            TaskError::Failed { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    /// Code persisted on the record when this error ends a task.
    pub fn code(&self) -> ErrorCode {
        match self {
            TaskError::Detailed { details, .. } => details.code,
            TaskError::Failed { code, .. } => *code,
            TaskError::NotFound { .. } => ErrorCode::NotFound,
            TaskError::NonCancellable { .. } => ErrorCode::FailedPrecondition,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::non_retriable(format!("codec: {e}"))
    }
}
