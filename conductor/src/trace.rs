//! Per-task causal trace.
//!
//! Each task owns one append-only list of steps. The tracer also mirrors the
//! task's lifecycle state, which makes it the arbiter for terminal writes:
//! whichever caller flips a trace to a terminal state first wins, and every
//! later attempt is told it lost.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::{StepStatus, TaskId, TaskState};
use crate::io::notifier::{LifecycleEvent, Notifier};

pub const WATCHDOG_COMPONENT: &str = "watchdog";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceStep {
    pub component: String,
    pub action: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    pub status: StepStatus,
    pub is_decision_gate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<TraceStep>,
    #[serde(skip)]
    last_activity: Instant,
}

impl TraceRecord {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            created_at: Utc::now(),
            steps: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Steps flagged as decision gates, in order.
    pub fn decision_gates(&self) -> impl Iterator<Item = &TraceStep> {
        self.steps.iter().filter(|step| step.is_decision_gate)
    }
}

/// Step to append to a trace.
#[derive(Debug, Clone)]
pub struct StepInput<'a> {
    pub component: &'a str,
    pub action: &'a str,
    pub detail: &'a str,
    pub status: StepStatus,
    pub is_decision_gate: bool,
}

impl<'a> StepInput<'a> {
    pub fn ok(component: &'a str, action: &'a str, detail: &'a str) -> Self {
        Self {
            component,
            action,
            detail,
            status: StepStatus::Ok,
            is_decision_gate: false,
        }
    }

    pub fn error(component: &'a str, action: &'a str, detail: &'a str) -> Self {
        Self {
            status: StepStatus::Error,
            ..Self::ok(component, action, detail)
        }
    }

    pub fn gate(mut self) -> Self {
        self.is_decision_gate = true;
        self
    }
}

/// Thread-safe store of traces, one per task.
pub struct RequestTracer {
    records: RwLock<HashMap<TaskId, TraceRecord>>,
    notifier: Arc<dyn Notifier>,
}

impl RequestTracer {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TraceRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TraceRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the trace for `task_id`. A second call keeps the existing record.
    pub fn create(&self, task_id: TaskId) -> TraceHandle<'_> {
        let mut records = self.write();
        if records.contains_key(&task_id) {
            warn!(task_id = %task_id, "trace already exists");
        } else {
            records.insert(task_id, TraceRecord::new(task_id));
        }
        TraceHandle {
            tracer: self,
            task_id,
        }
    }

    /// Borrow a handle for an existing (or unknown) trace.
    pub fn handle(&self, task_id: TaskId) -> TraceHandle<'_> {
        TraceHandle {
            tracer: self,
            task_id,
        }
    }

    /// Append a step. Unknown task ids are logged and ignored.
    pub fn record(&self, task_id: TaskId, step: StepInput<'_>) {
        let event = {
            let mut records = self.write();
            let Some(record) = records.get_mut(&task_id) else {
                warn!(task_id = %task_id, action = step.action, "step for unknown trace dropped");
                return;
            };
            record.steps.push(TraceStep {
                component: step.component.to_string(),
                action: step.action.to_string(),
                detail: step.detail.to_string(),
                timestamp: Utc::now(),
                status: step.status,
                is_decision_gate: step.is_decision_gate,
            });
            record.last_activity = Instant::now();
            LifecycleEvent::StepAdded {
                task_id,
                index: record.steps.len() - 1,
                component: step.component.to_string(),
                action: step.action.to_string(),
                status: step.status,
                is_decision_gate: step.is_decision_gate,
            }
        };
        self.notifier.emit(event);
    }

    pub fn add_step(
        &self,
        task_id: TaskId,
        component: &str,
        action: &str,
        detail: &str,
        is_decision_gate: bool,
    ) {
        let mut step = StepInput::ok(component, action, detail);
        step.is_decision_gate = is_decision_gate;
        self.record(task_id, step);
    }

    pub fn add_error_step(&self, task_id: TaskId, component: &str, action: &str, detail: &str) {
        self.record(task_id, StepInput::error(component, action, detail));
    }

    /// Mirror the PENDING -> PROCESSING move. Returns false if the trace is
    /// unknown or no longer pending.
    pub fn mark_processing(&self, task_id: TaskId) -> bool {
        let mut records = self.write();
        match records.get_mut(&task_id) {
            Some(record) if record.state == TaskState::Pending => {
                record.state = TaskState::Processing;
                record.last_activity = Instant::now();
                true
            }
            Some(record) => {
                debug!(task_id = %task_id, state = %record.state, "trace not pending");
                false
            }
            None => {
                warn!(task_id = %task_id, "mark_processing on unknown trace");
                false
            }
        }
    }

    /// Set the terminal state once. Returns true only for the call that won.
    pub fn mark_terminal(&self, task_id: TaskId, state: TaskState) -> bool {
        if !state.is_terminal() {
            warn!(task_id = %task_id, state = %state, "mark_terminal with non-terminal state");
            return false;
        }
        let mut records = self.write();
        match records.get_mut(&task_id) {
            Some(record) if !record.is_terminal() => {
                record.state = state;
                true
            }
            Some(record) => {
                debug!(task_id = %task_id, existing = %record.state, requested = %state, "terminal state already set");
                false
            }
            None => {
                warn!(task_id = %task_id, "mark_terminal on unknown trace");
                false
            }
        }
    }

    pub fn snapshot(&self, task_id: TaskId) -> Option<TraceRecord> {
        self.read().get(&task_id).cloned()
    }

    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.read().get(&task_id).map(|record| record.state)
    }

    /// Flag processing traces silent for longer than `timeout` as LOST.
    pub fn sweep_stalled(&self, timeout: Duration) -> Vec<TaskId> {
        self.sweep_stalled_at(timeout, Instant::now())
    }

    /// [`sweep_stalled`](Self::sweep_stalled) against an explicit clock.
    pub fn sweep_stalled_at(&self, timeout: Duration, now: Instant) -> Vec<TaskId> {
        let detail = format!("no trace activity for {}s; marking lost", timeout.as_secs());
        let mut events = Vec::new();
        let mut lost = Vec::new();
        {
            let mut records = self.write();
            for record in records.values_mut() {
                if record.state != TaskState::Processing {
                    continue;
                }
                if now.saturating_duration_since(record.last_activity) <= timeout {
                    continue;
                }
                record.state = TaskState::Lost;
                record.steps.push(TraceStep {
                    component: WATCHDOG_COMPONENT.to_string(),
                    action: "stalled".to_string(),
                    detail: detail.clone(),
                    timestamp: Utc::now(),
                    status: StepStatus::Error,
                    is_decision_gate: true,
                });
                events.push(LifecycleEvent::StepAdded {
                    task_id: record.task_id,
                    index: record.steps.len() - 1,
                    component: WATCHDOG_COMPONENT.to_string(),
                    action: "stalled".to_string(),
                    status: StepStatus::Error,
                    is_decision_gate: true,
                });
                lost.push(record.task_id);
            }
        }
        for event in events {
            self.notifier.emit(event);
        }
        if !lost.is_empty() {
            warn!(count = lost.len(), "stalled tasks flagged lost");
        }
        lost
    }
}

/// Convenience wrapper binding a tracer to one task.
#[derive(Clone, Copy)]
pub struct TraceHandle<'a> {
    tracer: &'a RequestTracer,
    task_id: TaskId,
}

impl TraceHandle<'_> {
    pub fn step(&self, component: &str, action: &str, detail: &str) {
        self.tracer
            .record(self.task_id, StepInput::ok(component, action, detail));
    }

    pub fn gate(&self, component: &str, action: &str, detail: &str) {
        self.tracer
            .record(self.task_id, StepInput::ok(component, action, detail).gate());
    }

    pub fn error(&self, component: &str, action: &str, detail: &str) {
        self.tracer
            .record(self.task_id, StepInput::error(component, action, detail));
    }

    pub fn error_gate(&self, component: &str, action: &str, detail: &str) {
        self.tracer
            .record(self.task_id, StepInput::error(component, action, detail).gate());
    }
}
