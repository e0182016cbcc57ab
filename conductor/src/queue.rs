//! Bounded admission queue with operator governance.
//!
//! The queue owns the concurrency ceiling. A slot is taken when
//! [`AdmissionQueue::dequeue`] hands out an [`Admission`] and is returned
//! when that guard drops or [`AdmissionQueue::release`] is called for the
//! task, whichever happens first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::types::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub concurrency_limit: usize,
    /// Reject enqueues beyond this many pending tasks. Unlimited when `None`.
    pub max_pending: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_pending: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("queue is shutting down")]
    ShuttingDown,
    #[error("queue is full ({0} pending)")]
    Full(usize),
}

/// Snapshot of governance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub active: usize,
    pub pending: usize,
    pub limit: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmergencyStopReport {
    pub cancelled: Vec<TaskId>,
    pub purged: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The task was still pending and has been removed.
    RemovedPending,
    /// The task holds a slot; its cancellation token was fired.
    CancelRequested,
    /// The queue does not know the task (finished or never enqueued).
    NotQueued,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<TaskId>,
    active: HashMap<TaskId, CancellationToken>,
    paused: bool,
    closed: bool,
}

pub struct AdmissionQueue {
    inner: Mutex<QueueInner>,
    config: QueueConfig,
    changed: Notify,
    shutdown: CancellationToken,
}

impl AdmissionQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = QueueConfig {
            concurrency_limit: config.concurrency_limit.max(1),
            ..config
        };
        Self {
            inner: Mutex::new(QueueInner::default()),
            config,
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a task. Paused queues still accept work.
    pub fn enqueue(&self, task_id: TaskId) -> Result<(), EnqueueError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(EnqueueError::ShuttingDown);
            }
            if let Some(max) = self.config.max_pending
                && inner.pending.len() >= max
            {
                warn!(task_id = %task_id, pending = inner.pending.len(), "queue full, rejecting");
                return Err(EnqueueError::Full(inner.pending.len()));
            }
            inner.pending.push_back(task_id);
            debug!(task_id = %task_id, pending = inner.pending.len(), "enqueued");
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Wait for the next admissible task.
    ///
    /// Suspends while paused, while every slot is taken, or while nothing is
    /// pending. Returns `None` once the queue is closed.
    pub async fn dequeue(self: &Arc<Self>) -> Option<Admission> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a wake-up between the check
            // and the await is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if !inner.paused
                    && inner.active.len() < self.config.concurrency_limit
                    && let Some(task_id) = inner.pending.pop_front()
                {
                    let cancel = self.shutdown.child_token();
                    inner.active.insert(task_id, cancel.clone());
                    debug!(task_id = %task_id, active = inner.active.len(), "admitted");
                    return Some(Admission {
                        task_id,
                        cancel,
                        queue: Arc::clone(self),
                    });
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    pub fn pause(&self) -> QueueStatus {
        let status = {
            let mut inner = self.lock();
            inner.paused = true;
            self.status_of(&inner)
        };
        info!("queue paused");
        status
    }

    pub fn resume(&self) -> QueueStatus {
        let status = {
            let mut inner = self.lock();
            inner.paused = false;
            self.status_of(&inner)
        };
        info!("queue resumed");
        self.changed.notify_waiters();
        status
    }

    /// Remove every pending task. In-flight tasks are untouched.
    pub fn purge(&self) -> Vec<TaskId> {
        let purged: Vec<TaskId> = self.lock().pending.drain(..).collect();
        info!(count = purged.len(), "queue purged");
        purged
    }

    /// Cancel every in-flight task, purge pending work and pause dispatch.
    pub fn emergency_stop(&self) -> EmergencyStopReport {
        let report = {
            let mut inner = self.lock();
            inner.paused = true;
            let cancelled = inner
                .active
                .iter()
                .map(|(task_id, cancel)| {
                    cancel.cancel();
                    *task_id
                })
                .collect();
            let purged = inner.pending.drain(..).collect();
            EmergencyStopReport { cancelled, purged }
        };
        warn!(
            cancelled = report.cancelled.len(),
            purged = report.purged.len(),
            "emergency stop"
        );
        report
    }

    pub fn abort(&self, task_id: TaskId) -> AbortOutcome {
        let mut inner = self.lock();
        if let Some(pos) = inner.pending.iter().position(|id| *id == task_id) {
            inner.pending.remove(pos);
            return AbortOutcome::RemovedPending;
        }
        if let Some(cancel) = inner.active.get(&task_id) {
            cancel.cancel();
            return AbortOutcome::CancelRequested;
        }
        AbortOutcome::NotQueued
    }

    /// Free the slot held by `task_id`. Returns false if it held none.
    pub fn release(&self, task_id: TaskId) -> bool {
        let released = self.lock().active.remove(&task_id).is_some();
        if released {
            debug!(task_id = %task_id, "slot released");
            self.changed.notify_waiters();
        }
        released
    }

    pub fn cancel_token(&self, task_id: TaskId) -> Option<CancellationToken> {
        self.lock().active.get(&task_id).cloned()
    }

    pub fn status(&self) -> QueueStatus {
        self.status_of(&self.lock())
    }

    fn status_of(&self, inner: &QueueInner) -> QueueStatus {
        QueueStatus {
            active: inner.active.len(),
            pending: inner.pending.len(),
            limit: self.config.concurrency_limit,
            paused: inner.paused,
        }
    }

    /// Reject new work, cancel in-flight tasks and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shutdown.cancel();
        self.changed.notify_waiters();
    }
}

/// A dispatched task holding one concurrency slot.
pub struct Admission {
    task_id: TaskId,
    cancel: CancellationToken,
    queue: Arc<AdmissionQueue>,
}

impl Admission {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.queue.release(self.task_id);
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}
