//! Stable exit codes for harness CLI commands.

use crate::core::types::TaskStatus;

/// Task succeeded, or a non-run command completed.
pub const OK: i32 = 0;
/// Task exited nonzero or broke its output rules.
pub const TASK_FAILED: i32 = 1;
/// Invalid config/task file, or the harness itself failed.
pub const INVALID: i32 = 2;
/// Task hit its wall-clock timeout.
pub const TIMED_OUT: i32 = 3;
/// Task crashed on a signal or the run was cancelled.
pub const ABORTED: i32 = 4;

pub fn for_status(status: TaskStatus) -> i32 {
    match status {
        TaskStatus::Succeeded => OK,
        TaskStatus::Failed => TASK_FAILED,
        TaskStatus::TimedOut => TIMED_OUT,
        TaskStatus::Crashed | TaskStatus::Cancelled => ABORTED,
    }
}
