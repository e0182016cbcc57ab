//! Fire-and-forget lifecycle events for observability consumers.
//!
//! Publishing never waits on subscribers. The broadcast notifier keeps a
//! bounded ring per channel; a subscriber that falls behind loses the oldest
//! events and observes a `Lagged` error instead of stalling task execution.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::routing::Intent;
use crate::core::types::{FailureReason, StepStatus, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    TaskCreated {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
    },
    StepAdded {
        task_id: TaskId,
        index: usize,
        component: String,
        action: String,
        status: StepStatus,
        is_decision_gate: bool,
    },
    TaskCompleted {
        task_id: TaskId,
        intent: Option<Intent>,
    },
    TaskFailed {
        task_id: TaskId,
        reason: FailureReason,
        detail: String,
    },
    TaskAborted {
        task_id: TaskId,
        reason: FailureReason,
    },
    TaskLost {
        task_id: TaskId,
    },
}

impl LifecycleEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            LifecycleEvent::TaskCreated { task_id }
            | LifecycleEvent::TaskStarted { task_id }
            | LifecycleEvent::StepAdded { task_id, .. }
            | LifecycleEvent::TaskCompleted { task_id, .. }
            | LifecycleEvent::TaskFailed { task_id, .. }
            | LifecycleEvent::TaskAborted { task_id, .. }
            | LifecycleEvent::TaskLost { task_id } => *task_id,
        }
    }

    /// Wire name of the event, as used in the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::TaskCreated { .. } => "task_created",
            LifecycleEvent::TaskStarted { .. } => "task_started",
            LifecycleEvent::StepAdded { .. } => "step_added",
            LifecycleEvent::TaskCompleted { .. } => "task_completed",
            LifecycleEvent::TaskFailed { .. } => "task_failed",
            LifecycleEvent::TaskAborted { .. } => "task_aborted",
            LifecycleEvent::TaskLost { .. } => "task_lost",
        }
    }
}

pub trait Notifier: Send + Sync {
    /// Publish an event. Must not block.
    fn emit(&self, event: LifecycleEvent);
}

/// Notifier that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Bounded broadcast fan-out with drop-oldest overflow.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: LifecycleEvent) {
        // An error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}
