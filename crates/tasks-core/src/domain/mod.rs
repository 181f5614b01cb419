//! Domain model (ids, status, task records, errors).

pub mod errors;
pub mod ids;
pub mod node;
pub mod operation;
pub mod status;
pub mod task;

pub use errors::{ErrorCode, ErrorDetails, TaskError};
pub use ids::{RunnerId, TaskId};
pub use node::{Node, Schedule, TaskSchedule};
pub use operation::{Operation, OperationResult};
pub use status::TaskStatus;
pub use task::{RequestContext, TaskInfo, TaskState};

pub type Result<T, E = TaskError> = std::result::Result<T, E>;
