//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a task record.
///
/// State transitions:
/// - ReadyToRun -> Running -> Finished
/// - ReadyToRun <-> WaitingToRun (pause / resume)
/// - {ReadyToRun, WaitingToRun, Running} -> ReadyToCancel -> Cancelling -> Cancelled
/// - Running -> ReadyToCancel (terminal run failure, so `Task::cancel` can undo side effects)
///
/// The numeric order is significant: everything at or past `Finished` resolves
/// dependants.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskStatus {
    #[default]
    ReadyToRun = 0,
    WaitingToRun = 1,
    Running = 2,
    Finished = 3,
    ReadyToCancel = 4,
    Cancelling = 5,
    Cancelled = 6,
}

impl TaskStatus {
    /// No runner will ever touch the task again.
    pub fn is_ended(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Cancelled)
    }

    /// On the cancel path (requested, in progress or done).
    pub fn is_cancelling(self) -> bool {
        matches!(
            self,
            TaskStatus::ReadyToCancel | TaskStatus::Cancelling | TaskStatus::Cancelled
        )
    }

    /// Dependants waiting on a task in this status may proceed.
    pub fn resolves_dependants(self) -> bool {
        self >= TaskStatus::Finished
    }

    /// Caller-facing "operation is done" flag.
    pub fn is_done(self) -> bool {
        !matches!(self, TaskStatus::ReadyToRun | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::ReadyToRun => "ready_to_run",
            TaskStatus::WaitingToRun => "waiting_to_run",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::ReadyToCancel => "ready_to_cancel",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
