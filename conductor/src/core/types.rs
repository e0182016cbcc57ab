//! Shared deterministic types for the conductor core.
//!
//! These types define stable contracts between components and the HTTP
//! surface. Serialized names are part of the API and must not drift.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to a task at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a task id from its hyphenated string form.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task.
///
/// States only move forward: `Pending -> Processing -> terminal`, or
/// `Pending -> Aborted` when a queued task is removed before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Lost,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Lost | TaskState::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Processing => "PROCESSING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Lost => "LOST",
            TaskState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome flag of a single trace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
}

/// Reason code attached to a task that did not complete.
///
/// Deliberate stops (`LoopDetected`, `BudgetExceeded`, `IterationsExhausted`)
/// are distinguishable from genuine defects (`ExecutorError`, `WorkerPanicked`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ExecutorError,
    Timeout,
    UnknownIntent,
    InvalidPayload,
    LoopDetected,
    BudgetExceeded,
    IterationsExhausted,
    WorkerPanicked,
    Stalled,
    Aborted,
    Purged,
    EmergencyStop,
    Rejected,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::ExecutorError => "executor_error",
            FailureReason::Timeout => "timeout",
            FailureReason::UnknownIntent => "unknown_intent",
            FailureReason::InvalidPayload => "invalid_payload",
            FailureReason::LoopDetected => "loop_detected",
            FailureReason::BudgetExceeded => "budget_exceeded",
            FailureReason::IterationsExhausted => "iterations_exhausted",
            FailureReason::WorkerPanicked => "worker_panicked",
            FailureReason::Stalled => "stalled",
            FailureReason::Aborted => "aborted",
            FailureReason::Purged => "purged",
            FailureReason::EmergencyStop => "emergency_stop",
            FailureReason::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code plus human-readable detail for a non-completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub reason: FailureReason,
    pub detail: String,
}

impl FailureDetail {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}
