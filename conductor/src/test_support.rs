//! Scripted collaborators and polling helpers for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::types::{TaskId, TaskState};
use crate::io::capability::{CapabilityError, CapabilityExecutor, CapabilityOutput, Invocation};
use crate::io::cost::{CostEstimator, UnitOfWork};
use crate::io::notifier::{LifecycleEvent, Notifier};
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorConfig};
use crate::queue::{AdmissionQueue, QueueConfig};
use crate::trace::RequestTracer;

/// Output of a verification run that did not pass.
pub fn checks_failed(text: &str) -> CapabilityOutput {
    CapabilityOutput::failure(text)
}

/// How a scripted capability answers a call.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(CapabilityOutput),
    Error(CapabilityError),
    /// Never completes; ends only when the caller drops the call on
    /// timeout or cancellation.
    Hang,
    /// Blocks the worker thread for the duration without yielding, so no
    /// timeout or cancellation can interrupt it.
    Stuck(Duration),
    /// Panics inside the call.
    Panic(&'static str),
    /// Waits for one permit from the gate, then returns the output.
    Gated(Arc<Semaphore>, CapabilityOutput),
}

/// Executor answering from per-capability scripts.
///
/// One-shot replies queued with [`then`](Self::then) are used first, then
/// the standing reply from [`always`](Self::always). Capabilities with
/// neither are unavailable.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: HashMap<String, Reply>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, capability: &str, reply: Reply) -> Self {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(capability.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn always(mut self, capability: &str, reply: Reply) -> Self {
        self.standing.insert(capability.to_string(), reply);
        self
    }

    /// Standing reply that waits on a gate. Add permits to let calls finish.
    pub fn gated(self, capability: &str, output: CapabilityOutput) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let this = self.always(capability, Reply::Gated(Arc::clone(&gate), output));
        (this, gate)
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, capability: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|call| call.name == capability)
            .collect()
    }

    pub fn call_count(&self, capability: &str) -> usize {
        self.calls_for(capability).len()
    }

    fn next_reply(&self, capability: &str) -> Option<Reply> {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(capability)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.standing.get(capability).cloned())
    }
}

#[async_trait]
impl CapabilityExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        invocation: &Invocation,
        _cancel: &CancellationToken,
    ) -> Result<CapabilityOutput, CapabilityError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        match self.next_reply(&invocation.name) {
            None => Err(CapabilityError::Unavailable(invocation.name.clone())),
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Error(err)) => Err(err),
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::Stuck(duration)) => {
                std::thread::sleep(duration);
                Ok(CapabilityOutput::success(Value::Null))
            }
            Some(Reply::Panic(message)) => panic!("{message}"),
            Some(Reply::Gated(gate, output)) => {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| CapabilityError::Failed("gate closed".to_string()))?;
                permit.forget();
                Ok(output)
            }
        }
    }
}

/// Same estimate for every unit, with an optional different booked cost.
#[derive(Debug, Clone, Copy)]
pub struct FixedCostEstimator {
    estimate: f64,
    actual: Option<f64>,
}

impl FixedCostEstimator {
    pub fn new(estimate: f64) -> Self {
        Self {
            estimate,
            actual: None,
        }
    }

    pub fn with_actual(mut self, actual: f64) -> Self {
        self.actual = Some(actual);
        self
    }
}

impl CostEstimator for FixedCostEstimator {
    fn estimate(&self, _unit: &UnitOfWork) -> f64 {
        self.estimate
    }

    fn actual(&self, _unit: &UnitOfWork) -> f64 {
        self.actual.unwrap_or(self.estimate)
    }
}

/// Notifier that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Event kinds for one task, excluding step events.
    pub fn lifecycle_kinds(&self, task_id: TaskId) -> Vec<&'static str> {
        self.events()
            .iter()
            .filter(|event| event.task_id() == task_id)
            .map(LifecycleEvent::kind)
            .filter(|kind| *kind != "step_added")
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the task reaches `state`.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    task_id: TaskId,
    state: TaskState,
    timeout: Duration,
) -> bool {
    wait_until(timeout, || {
        orchestrator.task(task_id).map(|task| task.state) == Some(state)
    })
    .await
}

/// Wait until the task is in any terminal state.
pub async fn wait_for_terminal(
    orchestrator: &Orchestrator,
    task_id: TaskId,
    timeout: Duration,
) -> Option<TaskState> {
    let reached = wait_until(timeout, || {
        orchestrator
            .task(task_id)
            .is_some_and(|task| task.state.is_terminal())
    })
    .await;
    if reached {
        orchestrator.task(task_id).map(|task| task.state)
    } else {
        None
    }
}

/// Payload for a direct intent.
pub fn payload(intent: &str) -> Value {
    serde_json::json!({ "intent": intent, "params": {} })
}

/// Payload for a code-fix task.
pub fn code_fix_payload(target_file: &str) -> Value {
    serde_json::json!({ "intent": "code_fix", "target_file": target_file })
}

/// Orchestrator wired to scripted collaborators.
pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub executor: Arc<ScriptedExecutor>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    pub fn new(executor: ScriptedExecutor, concurrency_limit: usize) -> Self {
        Self::with_config(
            executor,
            QueueConfig {
                concurrency_limit,
                max_pending: None,
            },
            OrchestratorConfig::default(),
            FixedCostEstimator::new(0.0),
        )
    }

    pub fn with_config(
        executor: ScriptedExecutor,
        queue: QueueConfig,
        config: OrchestratorConfig,
        estimator: FixedCostEstimator,
    ) -> Self {
        let executor = Arc::new(executor);
        let notifier = Arc::new(RecordingNotifier::new());
        let tracer = Arc::new(RequestTracer::new(notifier.clone()));
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(AdmissionQueue::new(queue)),
            tracer,
            Collaborators {
                executor: executor.clone(),
                cost: Arc::new(estimator),
                notifier: notifier.clone(),
            },
        );
        Self {
            orchestrator,
            executor,
            notifier,
        }
    }
}
