//! Task records and their store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::lifecycle::{TransitionError, check_transition};
use crate::core::routing::Intent;
use crate::core::types::{FailureDetail, FailureReason, TaskId, TaskState};

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub payload: Value,
    pub intent: Option<Intent>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureDetail>,
    pub output: Option<Value>,
}

impl Task {
    pub fn new(id: TaskId, payload: Value) -> Self {
        Self {
            id,
            payload,
            intent: None,
            state: TaskState::Pending,
            created_at: Utc::now(),
            finished_at: None,
            failure: None,
            output: None,
        }
    }

    /// Move to `to`, stamping `finished_at` on terminal states.
    pub fn transition(&mut self, to: TaskState) -> Result<(), TransitionError> {
        check_transition(self.state, to)?;
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            state: self.state,
            intent: self.intent,
            created_at: self.created_at,
            finished_at: self.finished_at,
            reason: self.failure.as_ref().map(|f| f.reason),
            detail: self.failure.as_ref().map(|f| f.detail.clone()),
            output: self.output.clone(),
        }
    }
}

/// Public, serializable projection of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub state: TaskState,
    pub intent: Option<Intent>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(FailureDetail),
    Aborted(FailureReason),
    Lost,
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Aborted(_) => TaskState::Aborted,
            Outcome::Lost => TaskState::Lost,
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id, task);
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned()
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Apply `f` to the task under the write lock. `None` if unknown.
    pub fn update<R>(&self, task_id: TaskId, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&task_id)
            .map(f)
    }

    /// Record a terminal outcome. Fails if the transition is not allowed.
    pub fn finish(&self, task_id: TaskId, outcome: Outcome) -> Option<Result<(), TransitionError>> {
        self.update(task_id, |task| {
            task.transition(outcome.state())?;
            match outcome {
                Outcome::Completed(output) => task.output = Some(output),
                Outcome::Failed(detail) => task.failure = Some(detail),
                Outcome::Aborted(reason) => {
                    task.failure = Some(FailureDetail::new(reason, reason.as_str()));
                }
                Outcome::Lost => {
                    task.failure = Some(FailureDetail::new(
                        FailureReason::Stalled,
                        "no trace activity within the stall timeout",
                    ));
                }
            }
            Ok(())
        })
    }
}
