//! Run lifecycle state machine.
//!
//! ```text
//! Idle -> Preparing -> Running -> Collecting -> Done
//!            |            |-> TimedOut
//!            |            |-> Crashed
//!            |            `-> Cancelled
//!            `-> SetupFailed
//! ```
//!
//! `TimedOut`, `Crashed`, and `Cancelled` are terminal for the process but the
//! controller still finalizes capture and collects outputs while in them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Preparing,
    Running,
    Collecting,
    Done,
    SetupFailed,
    TimedOut,
    Crashed,
    Cancelled,
}

/// Inputs that drive [`RunState::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// `run` was called.
    Start,
    /// Workspace creation or launch failed; no process is running.
    SetupFailed,
    /// The process was spawned.
    Launched,
    /// The process exited on its own with a status code.
    Exited,
    /// The process was ended by a signal the harness did not send.
    Signalled,
    /// The wall-clock timeout elapsed first.
    DeadlineElapsed,
    /// An external cancellation request arrived first.
    CancelRequested,
    /// The result collector returned.
    Collected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid run state transition: {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub event: RunEvent,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::SetupFailed | Self::TimedOut | Self::Crashed | Self::Cancelled
        )
    }

    pub fn next(self, event: RunEvent) -> Result<Self, InvalidTransition> {
        let next = match (self, event) {
            (Self::Idle, RunEvent::Start) => Self::Preparing,
            (Self::Preparing, RunEvent::SetupFailed) => Self::SetupFailed,
            (Self::Preparing, RunEvent::Launched) => Self::Running,
            (Self::Running, RunEvent::Exited) => Self::Collecting,
            (Self::Running, RunEvent::Signalled) => Self::Crashed,
            (Self::Running, RunEvent::DeadlineElapsed) => Self::TimedOut,
            (Self::Running, RunEvent::CancelRequested) => Self::Cancelled,
            (Self::Collecting, RunEvent::Collected) => Self::Done,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Collecting => "collecting",
            Self::Done => "done",
            Self::SetupFailed => "setup_failed",
            Self::TimedOut => "timed_out",
            Self::Crashed => "crashed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}
