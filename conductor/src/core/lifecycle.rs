//! Task lifecycle transition table.

use thiserror::Error;

use crate::core::types::TaskState;

/// A transition that would move a task backwards or out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// Return true if `from -> to` is an allowed forward move.
///
/// - `PENDING -> PROCESSING`
/// - `PENDING -> ABORTED` (removed from the queue before dispatch)
/// - `PROCESSING -> COMPLETED | FAILED | LOST | ABORTED`
///
/// Terminal states never move again and no state transitions to itself.
pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    match from {
        TaskState::Pending => matches!(to, TaskState::Processing | TaskState::Aborted),
        TaskState::Processing => to.is_terminal(),
        TaskState::Completed | TaskState::Failed | TaskState::Lost | TaskState::Aborted => false,
    }
}

/// Validate a transition, returning a typed error when it is not allowed.
pub fn check_transition(from: TaskState, to: TaskState) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}
