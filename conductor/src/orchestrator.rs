//! Task lifecycle state machine and intent dispatch.
//!
//! The orchestrator owns the task store. Submissions are traced, queued and
//! later picked up by the dispatcher, which spawns one worker per admission.
//! Workers route by intent and either call one capability or run a healing
//! session. Terminal states go through the tracer first so that a finishing
//! worker and the watchdog can never both write one.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::routing::{Dispatch, Route, RouteError, RoutingTable, plan_dispatch};
use crate::core::types::{FailureDetail, FailureReason, TaskId, TaskState};
use crate::healing::{HealingConfig, HealingLoop, HealingStatus};
use crate::io::capability::{CapabilityError, CapabilityExecutor, Invocation, invoke_bounded};
use crate::io::cost::CostEstimator;
use crate::io::notifier::{LifecycleEvent, Notifier};
use crate::queue::{
    AbortOutcome, AdmissionQueue, EmergencyStopReport, EnqueueError, QueueStatus,
};
use crate::task::{Outcome, Task, TaskStore, TaskView};
use crate::trace::{RequestTracer, TraceRecord};

const COMPONENT: &str = "orchestrator";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Deadline for a direct capability call.
    pub executor_timeout: Duration,
    pub healing: HealingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executor_timeout: Duration::from_secs(300),
            healing: HealingConfig::default(),
        }
    }
}

/// External services the orchestrator calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn CapabilityExecutor>,
    pub cost: Arc<dyn CostEstimator>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("task {task_id} rejected: {reason}")]
    Rejected {
        task_id: TaskId,
        reason: EnqueueError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {0} already finished as {1}")]
    AlreadyTerminal(TaskId, TaskState),
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    routes: RoutingTable,
    queue: Arc<AdmissionQueue>,
    tracer: Arc<RequestTracer>,
    tasks: TaskStore,
    collaborators: Collaborators,
    /// Why a running task's token was cancelled, when an operator did it.
    cancel_reasons: Mutex<HashMap<TaskId, FailureReason>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<AdmissionQueue>,
        tracer: Arc<RequestTracer>,
        collaborators: Collaborators,
    ) -> Self {
        Self::with_routes(config, RoutingTable::default(), queue, tracer, collaborators)
    }

    pub fn with_routes(
        config: OrchestratorConfig,
        routes: RoutingTable,
        queue: Arc<AdmissionQueue>,
        tracer: Arc<RequestTracer>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                routes,
                queue,
                tracer,
                tasks: TaskStore::new(),
                collaborators,
                cancel_reasons: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn tracer(&self) -> &Arc<RequestTracer> {
        &self.inner.tracer
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.inner.queue
    }

    fn emit(&self, event: LifecycleEvent) {
        self.inner.collaborators.notifier.emit(event);
    }

    /// Accept a payload and queue it. A rejected task is recorded as ABORTED.
    pub fn submit(&self, payload: Value) -> Result<TaskId, SubmitError> {
        let task_id = TaskId::new();
        self.inner.tasks.insert(Task::new(task_id, payload));
        self.inner
            .tracer
            .create(task_id)
            .step(COMPONENT, "submitted", "task accepted");
        self.emit(LifecycleEvent::TaskCreated { task_id });

        if let Err(reason) = self.inner.queue.enqueue(task_id) {
            warn!(task_id = %task_id, reason = %reason, "submission rejected");
            self.inner.tracer.handle(task_id).error_gate(
                COMPONENT,
                "rejected",
                &reason.to_string(),
            );
            self.finish(task_id, Outcome::Aborted(FailureReason::Rejected));
            return Err(SubmitError::Rejected { task_id, reason });
        }
        debug!(task_id = %task_id, "task queued");
        Ok(task_id)
    }

    /// Spawn the dispatcher. It runs until the queue is closed.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(admission) = this.inner.queue.dequeue().await {
                let worker = this.clone();
                tokio::spawn(async move {
                    let task_id = admission.task_id();
                    let cancel = admission.cancel_token().clone();
                    worker.run_worker(task_id, &cancel).await;
                    drop(admission);
                });
            }
            info!("dispatcher stopped");
        })
    }

    async fn run_worker(&self, task_id: TaskId, cancel: &CancellationToken) {
        let result = AssertUnwindSafe(self.process(task_id, cancel))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task_id, panic = %message, "worker panicked");
                self.inner.tracer.handle(task_id).error_gate(
                    COMPONENT,
                    "worker_panicked",
                    &message,
                );
                Outcome::Failed(FailureDetail::new(FailureReason::WorkerPanicked, message))
            }
        };
        self.finish(task_id, outcome);
    }

    /// Run one admitted task. `None` when the task could not be started.
    async fn process(&self, task_id: TaskId, cancel: &CancellationToken) -> Option<Outcome> {
        let started = self
            .inner
            .tasks
            .update(task_id, |task| task.transition(TaskState::Processing).map(|()| task.payload.clone()));
        let payload = match started {
            Some(Ok(payload)) => payload,
            Some(Err(err)) => {
                warn!(task_id = %task_id, error = %err, "admitted task not startable");
                return None;
            }
            None => {
                warn!(task_id = %task_id, "admitted unknown task");
                return None;
            }
        };
        self.inner.tracer.mark_processing(task_id);
        self.emit(LifecycleEvent::TaskStarted { task_id });
        let trace = self.inner.tracer.handle(task_id);

        if cancel.is_cancelled() {
            return Some(self.cancelled_outcome(task_id));
        }

        let dispatch = match plan_dispatch(&payload, &self.inner.routes) {
            Ok(dispatch) => dispatch,
            Err(err) => {
                trace.error_gate(COMPONENT, "route", &err.to_string());
                warn!(task_id = %task_id, error = %err, "routing failed");
                return Some(Outcome::Failed(FailureDetail::new(
                    route_failure_reason(&err),
                    err.to_string(),
                )));
            }
        };
        self.inner
            .tasks
            .update(task_id, |task| task.intent = Some(dispatch.intent));
        trace.gate(COMPONENT, "route", &dispatch.route.describe());

        Some(self.execute(task_id, dispatch, cancel).await)
    }

    async fn execute(
        &self,
        task_id: TaskId,
        dispatch: Dispatch,
        cancel: &CancellationToken,
    ) -> Outcome {
        let trace = self.inner.tracer.handle(task_id);
        match dispatch.route {
            Route::Direct { capability } => {
                let invocation = Invocation::new(capability.as_str(), dispatch.params);
                let result = invoke_bounded(
                    self.inner.collaborators.executor.as_ref(),
                    &invocation,
                    self.inner.config.executor_timeout,
                    cancel,
                )
                .await;
                match result {
                    Ok(output) if output.ok => {
                        trace.step(COMPONENT, "invoke", &format!("{capability} succeeded"));
                        Outcome::Completed(output.output)
                    }
                    Ok(output) => {
                        let detail = output.failure_detail();
                        trace.error(COMPONENT, "invoke", &detail);
                        Outcome::Failed(FailureDetail::new(FailureReason::ExecutorError, detail))
                    }
                    Err(CapabilityError::Cancelled) => self.cancelled_outcome(task_id),
                    Err(err @ CapabilityError::TimedOut(_)) => {
                        trace.error(COMPONENT, "invoke", &err.to_string());
                        Outcome::Failed(FailureDetail::new(FailureReason::Timeout, err.to_string()))
                    }
                    Err(err) => {
                        trace.error(COMPONENT, "invoke", &err.to_string());
                        Outcome::Failed(FailureDetail::new(
                            FailureReason::ExecutorError,
                            err.to_string(),
                        ))
                    }
                }
            }
            Route::Healing => {
                // plan_dispatch guarantees a target for healing routes.
                let target_file = dispatch.target_file.unwrap_or_default();
                let report = HealingLoop::new(
                    &self.inner.config.healing,
                    self.inner.collaborators.executor.as_ref(),
                    self.inner.collaborators.cost.as_ref(),
                    &self.inner.tracer,
                )
                .run(task_id, target_file, &dispatch.params, cancel)
                .await;
                match report.status {
                    HealingStatus::Success => {
                        Outcome::Completed(serde_json::to_value(&report).unwrap_or_default())
                    }
                    HealingStatus::Cancelled => self.cancelled_outcome(task_id),
                    status => Outcome::Failed(FailureDetail::new(
                        status
                            .failure_reason()
                            .unwrap_or(FailureReason::ExecutorError),
                        report.detail(),
                    )),
                }
            }
        }
    }

    fn cancelled_outcome(&self, task_id: TaskId) -> Outcome {
        let reason = self
            .inner
            .cancel_reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .copied()
            .unwrap_or(FailureReason::Aborted);
        Outcome::Aborted(reason)
    }

    fn note_cancel_reason(&self, task_id: TaskId, reason: FailureReason) {
        self.inner
            .cancel_reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, reason);
    }

    /// Write a terminal outcome. Returns false if another writer got there first.
    fn finish(&self, task_id: TaskId, outcome: Outcome) -> bool {
        let state = outcome.state();
        if !self.inner.tracer.mark_terminal(task_id, state) {
            debug!(task_id = %task_id, state = %state, "terminal state already decided");
            return false;
        }
        self.inner
            .cancel_reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);

        let event = match &outcome {
            Outcome::Completed(_) => LifecycleEvent::TaskCompleted {
                task_id,
                intent: self.inner.tasks.get(task_id).and_then(|task| task.intent),
            },
            Outcome::Failed(detail) => LifecycleEvent::TaskFailed {
                task_id,
                reason: detail.reason,
                detail: detail.detail.clone(),
            },
            Outcome::Aborted(reason) => LifecycleEvent::TaskAborted {
                task_id,
                reason: *reason,
            },
            Outcome::Lost => LifecycleEvent::TaskLost { task_id },
        };
        match self.inner.tasks.finish(task_id, outcome) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                error!(task_id = %task_id, error = %err, "task store rejected terminal state");
                return false;
            }
            None => {
                warn!(task_id = %task_id, "finish for unknown task");
                return false;
            }
        }
        info!(task_id = %task_id, state = %state, "task finished");
        self.emit(event);
        true
    }

    /// Abort a pending or running task.
    pub fn abort(&self, task_id: TaskId) -> Result<(), AbortError> {
        let task = self
            .inner
            .tasks
            .get(task_id)
            .ok_or(AbortError::NotFound(task_id))?;
        if task.state.is_terminal() {
            return Err(AbortError::AlreadyTerminal(task_id, task.state));
        }
        match self.inner.queue.abort(task_id) {
            AbortOutcome::RemovedPending => {
                self.inner.tracer.handle(task_id).gate(
                    COMPONENT,
                    "abort",
                    "removed from queue by operator",
                );
                self.finish(task_id, Outcome::Aborted(FailureReason::Aborted));
                Ok(())
            }
            AbortOutcome::CancelRequested => {
                self.note_cancel_reason(task_id, FailureReason::Aborted);
                self.inner.tracer.handle(task_id).gate(
                    COMPONENT,
                    "abort",
                    "cancellation requested by operator",
                );
                Ok(())
            }
            AbortOutcome::NotQueued => match self.inner.tasks.get(task_id) {
                Some(task) if task.state.is_terminal() => {
                    Err(AbortError::AlreadyTerminal(task_id, task.state))
                }
                _ => Err(AbortError::NotFound(task_id)),
            },
        }
    }

    pub fn pause(&self) -> QueueStatus {
        self.inner.queue.pause()
    }

    pub fn resume(&self) -> QueueStatus {
        self.inner.queue.resume()
    }

    /// Drop every pending task; each is recorded as ABORTED (`purged`).
    pub fn purge(&self) -> Vec<TaskId> {
        let purged = self.inner.queue.purge();
        for task_id in &purged {
            self.inner
                .tracer
                .handle(*task_id)
                .gate(COMPONENT, "purge", "removed from queue by purge");
            self.finish(*task_id, Outcome::Aborted(FailureReason::Purged));
        }
        purged
    }

    /// Cancel in-flight work, drop pending work and pause dispatch.
    pub fn emergency_stop(&self) -> EmergencyStopReport {
        let report = self.inner.queue.emergency_stop();
        for task_id in &report.cancelled {
            self.note_cancel_reason(*task_id, FailureReason::EmergencyStop);
            self.inner
                .tracer
                .handle(*task_id)
                .gate(COMPONENT, "emergency_stop", "cancelled by emergency stop");
        }
        for task_id in &report.purged {
            self.inner
                .tracer
                .handle(*task_id)
                .gate(COMPONENT, "emergency_stop", "removed from queue by emergency stop");
            self.finish(*task_id, Outcome::Aborted(FailureReason::EmergencyStop));
        }
        report
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.inner.queue.status()
    }

    pub fn task(&self, task_id: TaskId) -> Option<TaskView> {
        self.inner.tasks.get(task_id).map(|task| task.view())
    }

    pub fn tasks(&self) -> Vec<TaskView> {
        self.inner.tasks.list().iter().map(Task::view).collect()
    }

    pub fn trace(&self, task_id: TaskId) -> Option<TraceRecord> {
        self.inner.tracer.snapshot(task_id)
    }

    /// Record a stalled task as LOST, cancel its worker and free its slot.
    ///
    /// The trace may already be LOST (flagged by a sweep); any other terminal
    /// state means the task finished first and nothing changes.
    pub fn mark_lost(&self, task_id: TaskId) -> bool {
        let tracer = &self.inner.tracer;
        if !tracer.mark_terminal(task_id, TaskState::Lost)
            && tracer.state(task_id) != Some(TaskState::Lost)
        {
            return false;
        }
        let updated = matches!(self.inner.tasks.finish(task_id, Outcome::Lost), Some(Ok(())));
        if updated {
            warn!(task_id = %task_id, "task lost");
            self.emit(LifecycleEvent::TaskLost { task_id });
        }
        if let Some(cancel) = self.inner.queue.cancel_token(task_id) {
            cancel.cancel();
        }
        self.inner.queue.release(task_id);
        updated
    }

    /// Stop accepting work and cancel everything in flight.
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.queue.close();
    }
}

fn route_failure_reason(err: &RouteError) -> FailureReason {
    match err {
        RouteError::InvalidPayload | RouteError::MissingTarget(_) => FailureReason::InvalidPayload,
        RouteError::MissingIntent | RouteError::UnknownIntent(_) | RouteError::Unrouted(_) => {
            FailureReason::UnknownIntent
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
