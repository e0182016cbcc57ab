//! Bounded verify/diagnose/fix loop for code-modification tasks.
//!
//! Each session runs at most `max_iterations` cycles and stops early on
//! success, cancellation, a repeating failure signature, or a fix whose
//! estimated cost would push the session past `max_cost`. Every stop is
//! recorded as a decision gate in the task's trace.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::CostBudget;
use crate::core::signature::{failure_signature, is_repeating, trailing_repeats};
use crate::core::types::{FailureReason, TaskId};
use crate::io::capability::{CapabilityError, CapabilityExecutor, Invocation, invoke_bounded};
use crate::io::cost::{CostEstimator, UnitOfWork};
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET, DiagnoseInputs, FixInputs, render_diagnose, render_fix};
use crate::trace::{RequestTracer, TraceHandle};

const COMPONENT: &str = "healing";

#[derive(Debug, Clone, PartialEq)]
pub struct HealingConfig {
    pub max_iterations: u32,
    /// Consecutive identical failure signatures tolerated before stopping.
    pub max_repeat: u32,
    pub max_cost: f64,
    /// Deadline for each capability call inside an iteration.
    pub iteration_timeout: Duration,
    pub verify_capability: String,
    pub diagnose_capability: String,
    pub fix_capability: String,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_repeat: 2,
            max_cost: 1.0,
            iteration_timeout: Duration::from_secs(300),
            verify_capability: "run_checks".to_string(),
            diagnose_capability: "diagnose".to_string(),
            fix_capability: "generate_fix".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStatus {
    Success,
    LoopDetected,
    BudgetExceeded,
    IterationsExhausted,
    Cancelled,
}

impl HealingStatus {
    /// Failure reason for a session that did not succeed.
    pub fn failure_reason(self) -> Option<FailureReason> {
        match self {
            HealingStatus::Success => None,
            HealingStatus::LoopDetected => Some(FailureReason::LoopDetected),
            HealingStatus::BudgetExceeded => Some(FailureReason::BudgetExceeded),
            HealingStatus::IterationsExhausted => Some(FailureReason::IterationsExhausted),
            HealingStatus::Cancelled => Some(FailureReason::Aborted),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingReport {
    pub status: HealingStatus,
    /// Iterations started, counting the one that stopped the loop.
    pub iterations: u32,
    pub verification_calls: u32,
    pub cumulative_cost: f64,
    pub target_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_diagnosis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

impl HealingReport {
    /// Best detail to attach to a failed task.
    pub fn detail(&self) -> String {
        self.last_diagnosis
            .clone()
            .or_else(|| self.last_failure.clone())
            .unwrap_or_else(|| self.status_text().to_string())
    }

    fn status_text(&self) -> &'static str {
        match self.status {
            HealingStatus::Success => "verification passed",
            HealingStatus::LoopDetected => "repeated identical failure",
            HealingStatus::BudgetExceeded => "cost budget exhausted",
            HealingStatus::IterationsExhausted => "iteration limit reached",
            HealingStatus::Cancelled => "cancelled",
        }
    }
}

/// Structured reply of the diagnosis capability.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    #[serde(default)]
    pub suggestion: Option<String>,
    /// A different file the defect should be fixed in.
    #[serde(default)]
    pub target_file: Option<String>,
}

impl Diagnosis {
    fn fallback(failure: &str) -> Self {
        Self {
            summary: failure.to_string(),
            suggestion: None,
            target_file: None,
        }
    }

    /// Parse a capability output: a JSON object, a JSON string holding one,
    /// or plain text used as the summary.
    pub fn from_output(output: &Value) -> Option<Self> {
        let parsed = match output {
            Value::Object(_) => serde_json::from_value::<Self>(output.clone()).ok(),
            Value::String(text) => Some(
                serde_json::from_str(text).unwrap_or_else(|_| Self::fallback(text.trim())),
            ),
            _ => None,
        };
        parsed.filter(|diagnosis| !diagnosis.summary.trim().is_empty())
    }
}

/// Ephemeral state of one session.
#[derive(Debug)]
struct HealingSession {
    iteration: u32,
    verification_calls: u32,
    budget: CostBudget,
    signatures: Vec<String>,
    target_file: String,
    last_diagnosis: Option<String>,
    last_failure: Option<String>,
}

impl HealingSession {
    fn report(self, status: HealingStatus) -> HealingReport {
        HealingReport {
            status,
            iterations: self.iteration,
            verification_calls: self.verification_calls,
            cumulative_cost: self.budget.spent(),
            target_file: self.target_file,
            last_diagnosis: self.last_diagnosis,
            last_failure: self.last_failure,
        }
    }
}

enum Verification {
    Passed,
    Failed(String),
    Cancelled,
}

pub struct HealingLoop<'a> {
    config: &'a HealingConfig,
    executor: &'a dyn CapabilityExecutor,
    estimator: &'a dyn CostEstimator,
    tracer: &'a RequestTracer,
}

impl<'a> HealingLoop<'a> {
    pub fn new(
        config: &'a HealingConfig,
        executor: &'a dyn CapabilityExecutor,
        estimator: &'a dyn CostEstimator,
        tracer: &'a RequestTracer,
    ) -> Self {
        Self {
            config,
            executor,
            estimator,
            tracer,
        }
    }

    #[instrument(skip_all, fields(task_id = %task_id, target_file = %target_file))]
    pub async fn run(
        &self,
        task_id: TaskId,
        target_file: String,
        params: &Value,
        cancel: &CancellationToken,
    ) -> HealingReport {
        let trace = self.tracer.handle(task_id);
        let mut session = HealingSession {
            iteration: 0,
            verification_calls: 0,
            budget: CostBudget::new(self.config.max_cost),
            signatures: Vec::new(),
            target_file,
            last_diagnosis: None,
            last_failure: None,
        };

        while session.iteration < self.config.max_iterations {
            if cancel.is_cancelled() {
                return self.cancelled(&trace, session);
            }
            session.iteration += 1;
            let n = session.iteration;
            trace.step(
                COMPONENT,
                "iteration",
                &format!("iteration {n} of {} on {}", self.config.max_iterations, session.target_file),
            );

            let failure = match self.verify(&trace, &mut session, params, cancel).await {
                Verification::Passed => {
                    info!(iterations = n, "verification passed");
                    return session.report(HealingStatus::Success);
                }
                Verification::Cancelled => return self.cancelled(&trace, session),
                Verification::Failed(failure) => failure,
            };
            session.last_failure = Some(failure.clone());

            let signature = failure_signature(&failure);
            debug!(signature = %signature, "failure signature");
            session.signatures.push(signature);
            if is_repeating(&session.signatures, self.config.max_repeat) {
                let repeats = trailing_repeats(&session.signatures);
                trace.error_gate(
                    COMPONENT,
                    "loop_detected",
                    &format!(
                        "same failure seen {repeats} times in a row (max_repeat {}); stopping",
                        self.config.max_repeat
                    ),
                );
                warn!(repeats, "healing loop detected");
                return session.report(HealingStatus::LoopDetected);
            }

            if n >= self.config.max_iterations {
                trace.error_gate(
                    COMPONENT,
                    "iterations_exhausted",
                    &format!("verification still failing after {n} iterations"),
                );
                return session.report(HealingStatus::IterationsExhausted);
            }

            let unit = UnitOfWork {
                capability: self.config.fix_capability.clone(),
                target_file: Some(session.target_file.clone()),
                iteration: Some(n),
            };
            let estimate = self.estimator.estimate(&unit);
            if !session.budget.admits(estimate) {
                trace.error_gate(
                    COMPONENT,
                    "budget_exceeded",
                    &format!(
                        "fix estimate {estimate:.4} would exceed budget (spent {:.4} of {:.4})",
                        session.budget.spent(),
                        session.budget.max_cost()
                    ),
                );
                warn!(estimate, spent = session.budget.spent(), "healing budget exceeded");
                return session.report(HealingStatus::BudgetExceeded);
            }

            let Some(diagnosis) = self.diagnose(&trace, &mut session, &failure, cancel).await else {
                return self.cancelled(&trace, session);
            };
            if !self.fix(&trace, &mut session, &diagnosis, &failure, cancel).await {
                return self.cancelled(&trace, session);
            }
            if session.budget.is_overspent() {
                trace.error_gate(
                    COMPONENT,
                    "budget_exceeded",
                    &format!(
                        "fix cost more than its estimate {estimate:.4}; spent {:.4} of {:.4}",
                        session.budget.spent(),
                        session.budget.max_cost()
                    ),
                );
                warn!(estimate, spent = session.budget.spent(), "healing budget overspent");
                return session.report(HealingStatus::BudgetExceeded);
            }
        }

        session.report(HealingStatus::IterationsExhausted)
    }

    fn cancelled(&self, trace: &TraceHandle<'_>, session: HealingSession) -> HealingReport {
        trace.error_gate(COMPONENT, "cancelled", "cancellation requested; stopping");
        session.report(HealingStatus::Cancelled)
    }

    async fn verify(
        &self,
        trace: &TraceHandle<'_>,
        session: &mut HealingSession,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Verification {
        let invocation = Invocation::new(
            &self.config.verify_capability,
            with_fields(
                params,
                [
                    ("target_file", json!(session.target_file)),
                    ("iteration", json!(session.iteration)),
                ],
            ),
        );
        session.verification_calls += 1;
        let failure = match invoke_bounded(
            self.executor,
            &invocation,
            self.config.iteration_timeout,
            cancel,
        )
        .await
        {
            Ok(output) if output.ok => {
                trace.step(COMPONENT, "verify", "checks passed");
                return Verification::Passed;
            }
            Ok(output) => output.failure_detail(),
            Err(CapabilityError::Cancelled) => return Verification::Cancelled,
            Err(err) => err.to_string(),
        };
        trace.error(COMPONENT, "verify", &failure);
        Verification::Failed(failure)
    }

    /// Returns `None` only when cancelled.
    async fn diagnose(
        &self,
        trace: &TraceHandle<'_>,
        session: &mut HealingSession,
        failure: &str,
        cancel: &CancellationToken,
    ) -> Option<Diagnosis> {
        let prompt = render_diagnose(
            &DiagnoseInputs {
                target_file: &session.target_file,
                iteration: session.iteration,
                max_iterations: self.config.max_iterations,
                failure,
                previous: session.last_diagnosis.as_deref(),
            },
            DEFAULT_PROMPT_BUDGET,
        )
        .unwrap_or_else(|err| {
            warn!(error = %err, "diagnose prompt render failed; sending raw failure");
            failure.to_string()
        });
        let invocation = Invocation::new(
            &self.config.diagnose_capability,
            json!({
                "prompt": prompt,
                "target_file": session.target_file,
                "failure": failure,
            }),
        );
        let diagnosis = match invoke_bounded(
            self.executor,
            &invocation,
            self.config.iteration_timeout,
            cancel,
        )
        .await
        {
            Ok(output) if output.ok => Diagnosis::from_output(&output.output).unwrap_or_else(|| {
                trace.error(COMPONENT, "diagnose", "unusable diagnosis; using raw failure");
                Diagnosis::fallback(failure)
            }),
            Ok(output) => {
                trace.error(
                    COMPONENT,
                    "diagnose",
                    &format!("diagnosis failed: {}; using raw failure", output.failure_detail()),
                );
                Diagnosis::fallback(failure)
            }
            Err(CapabilityError::Cancelled) => return None,
            Err(err) => {
                trace.error(
                    COMPONENT,
                    "diagnose",
                    &format!("diagnosis failed: {err}; using raw failure"),
                );
                Diagnosis::fallback(failure)
            }
        };

        if let Some(new_target) = diagnosis
            .target_file
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != session.target_file)
        {
            trace.gate(
                COMPONENT,
                "retarget",
                &format!("retarget {} -> {new_target}", session.target_file),
            );
            info!(from = %session.target_file, to = new_target, "healing retargeted");
            session.target_file = new_target.to_string();
            // A new target starts a fresh streak.
            session.signatures.clear();
        }
        trace.step(COMPONENT, "diagnose", &diagnosis.summary);
        session.last_diagnosis = Some(diagnosis.summary.clone());
        Some(diagnosis)
    }

    /// Returns false only when cancelled. A failed fix is left for the next
    /// verification to judge.
    async fn fix(
        &self,
        trace: &TraceHandle<'_>,
        session: &mut HealingSession,
        diagnosis: &Diagnosis,
        failure: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let prompt = render_fix(
            &FixInputs {
                target_file: &session.target_file,
                summary: &diagnosis.summary,
                suggestion: diagnosis.suggestion.as_deref(),
                failure,
            },
            DEFAULT_PROMPT_BUDGET,
        )
        .unwrap_or_else(|err| {
            warn!(error = %err, "fix prompt render failed; sending diagnosis");
            diagnosis.summary.clone()
        });
        let invocation = Invocation::new(
            &self.config.fix_capability,
            json!({
                "prompt": prompt,
                "target_file": session.target_file,
                "diagnosis": diagnosis.summary,
            }),
        );
        let unit = UnitOfWork {
            capability: self.config.fix_capability.clone(),
            target_file: Some(session.target_file.clone()),
            iteration: Some(session.iteration),
        };
        match invoke_bounded(
            self.executor,
            &invocation,
            self.config.iteration_timeout,
            cancel,
        )
        .await
        {
            Ok(output) => {
                let cost = output.cost.unwrap_or_else(|| self.estimator.actual(&unit));
                session.budget.record(cost);
                let detail = format!(
                    "cost {cost:.4}, cumulative {:.4}",
                    session.budget.spent()
                );
                if output.ok {
                    trace.step(COMPONENT, "fix", &format!("fix applied to {}; {detail}", session.target_file));
                } else {
                    trace.error(
                        COMPONENT,
                        "fix",
                        &format!("fix failed: {}; {detail}", output.failure_detail()),
                    );
                }
                true
            }
            Err(CapabilityError::Cancelled) => false,
            Err(err) => {
                trace.error(COMPONENT, "fix", &format!("fix failed: {err}"));
                true
            }
        }
    }
}

/// Copy `params` into an object and add `fields`, overwriting duplicates.
fn with_fields<const N: usize>(params: &Value, fields: [(&str, Value); N]) -> Value {
    let mut object = match params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("params".to_string(), other.clone());
            map
        }
    };
    for (key, value) in fields {
        object.insert(key.to_string(), value);
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::types::{StepStatus, TaskState};
    use crate::io::capability::CapabilityOutput;
    use crate::io::notifier::NoopNotifier;
    use crate::test_support::{FixedCostEstimator, Reply, ScriptedExecutor, checks_failed};

    struct Harness {
        tracer: RequestTracer,
        task_id: TaskId,
    }

    impl Harness {
        fn new() -> Self {
            let tracer = RequestTracer::new(Arc::new(NoopNotifier));
            let task_id = TaskId::new();
            tracer.create(task_id);
            tracer.mark_processing(task_id);
            Self { tracer, task_id }
        }

        async fn run(
            &self,
            config: &HealingConfig,
            executor: &ScriptedExecutor,
            estimator: &FixedCostEstimator,
        ) -> HealingReport {
            HealingLoop::new(config, executor, estimator, &self.tracer)
                .run(
                    self.task_id,
                    "src/lib.rs".to_string(),
                    &json!({}),
                    &CancellationToken::new(),
                )
                .await
        }

        fn gates(&self) -> Vec<String> {
            self.tracer
                .snapshot(self.task_id)
                .expect("trace")
                .decision_gates()
                .map(|step| step.action.clone())
                .collect()
        }
    }

    fn config(max_iterations: u32, max_repeat: u32, max_cost: f64) -> HealingConfig {
        HealingConfig {
            max_iterations,
            max_repeat,
            max_cost,
            iteration_timeout: Duration::from_secs(5),
            ..HealingConfig::default()
        }
    }

    fn executor() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .always("diagnose", Reply::Output(CapabilityOutput::success(json!({"summary": "fix the assertion"}))))
            .always("generate_fix", Reply::Output(CapabilityOutput::success(Value::Null)))
    }

    #[tokio::test]
    async fn identical_failures_stop_after_max_repeat_plus_one() {
        let harness = Harness::new();
        let executor = executor().always("run_checks", Reply::Output(checks_failed("test foo failed")));
        let report = harness
            .run(&config(3, 1, 10.0), &executor, &FixedCostEstimator::new(0.1))
            .await;

        assert_eq!(report.status, HealingStatus::LoopDetected);
        assert_eq!(report.verification_calls, 2);
        assert_eq!(executor.call_count("run_checks"), 2);
        assert_eq!(executor.call_count("generate_fix"), 1);
        assert_eq!(harness.gates(), ["loop_detected"]);
    }

    #[tokio::test]
    async fn noisy_but_identical_failures_still_repeat() {
        let harness = Harness::new();
        let executor = executor()
            .then("run_checks", Reply::Output(checks_failed("panic at 0x7ffe10 after 12ms")))
            .then("run_checks", Reply::Output(checks_failed("panic at 0x7ffe99 after 40ms")));
        let report = harness
            .run(&config(3, 1, 10.0), &executor, &FixedCostEstimator::new(0.1))
            .await;
        assert_eq!(report.status, HealingStatus::LoopDetected);
    }

    #[tokio::test]
    async fn passes_after_a_fix() {
        let harness = Harness::new();
        let executor = executor()
            .then("run_checks", Reply::Output(checks_failed("test foo failed")))
            .then("run_checks", Reply::Output(CapabilityOutput::success(json!("ok"))));
        let report = harness
            .run(&config(3, 2, 10.0), &executor, &FixedCostEstimator::new(0.25))
            .await;

        assert_eq!(report.status, HealingStatus::Success);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.cumulative_cost, 0.25);
        assert_eq!(report.last_diagnosis.as_deref(), Some("fix the assertion"));
        assert!(harness.gates().is_empty());
    }

    #[tokio::test]
    async fn budget_guard_stops_before_the_fix_call() {
        let harness = Harness::new();
        let executor = executor().always("run_checks", Reply::Output(checks_failed("test foo failed")));
        let report = harness
            .run(&config(3, 5, 0.5), &executor, &FixedCostEstimator::new(0.6))
            .await;

        assert_eq!(report.status, HealingStatus::BudgetExceeded);
        assert_eq!(executor.call_count("diagnose"), 0);
        assert_eq!(executor.call_count("generate_fix"), 0);
        assert_eq!(report.cumulative_cost, 0.0);
        assert_eq!(harness.gates(), ["budget_exceeded"]);
    }

    #[tokio::test]
    async fn reported_cost_accumulates_until_budget_runs_out() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::new()
            .always("run_checks", Reply::Output(checks_failed("different each time?")))
            .always("diagnose", Reply::Output(CapabilityOutput::success(json!("plain text diagnosis"))))
            .always(
                "generate_fix",
                Reply::Output(CapabilityOutput::success(Value::Null).with_cost(0.4)),
            );
        let report = harness
            .run(&config(5, 10, 1.0), &executor, &FixedCostEstimator::new(0.3))
            .await;

        // 0.4 + 0.4 spent, then 0.8 + 0.3 > 1.0.
        assert_eq!(report.status, HealingStatus::BudgetExceeded);
        assert_eq!(executor.call_count("generate_fix"), 2);
        assert!((report.cumulative_cost - 0.8).abs() < 1e-9);
        assert!(report.cumulative_cost <= 1.0);
    }

    #[tokio::test]
    async fn overspent_fix_stops_before_the_next_verification() {
        let harness = Harness::new();
        let executor = executor()
            .always("run_checks", Reply::Output(checks_failed("test foo failed")));
        let estimator = FixedCostEstimator::new(0.2).with_actual(1.5);
        let report = harness.run(&config(5, 10, 1.0), &executor, &estimator).await;

        assert_eq!(report.status, HealingStatus::BudgetExceeded);
        assert_eq!(executor.call_count("generate_fix"), 1);
        assert_eq!(executor.call_count("run_checks"), 1);
        assert_eq!(report.cumulative_cost, 1.5);
        assert_eq!(harness.gates(), ["budget_exceeded"]);
    }

    #[tokio::test]
    async fn reported_cost_over_budget_stops_the_session() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::new()
            .always("run_checks", Reply::Output(checks_failed("test foo failed")))
            .always("diagnose", Reply::Output(CapabilityOutput::success(json!("diagnosis"))))
            .always(
                "generate_fix",
                Reply::Output(CapabilityOutput::success(Value::Null).with_cost(5.0)),
            );
        let report = harness
            .run(&config(3, 10, 1.0), &executor, &FixedCostEstimator::new(0.1))
            .await;

        assert_eq!(report.status, HealingStatus::BudgetExceeded);
        assert_eq!(report.cumulative_cost, 5.0);
        assert_eq!(executor.call_count("run_checks"), 1);
    }

    #[tokio::test]
    async fn final_iteration_reports_exhaustion_without_fixing() {
        let harness = Harness::new();
        let executor = executor()
            .then("run_checks", Reply::Output(checks_failed("error one")))
            .then("run_checks", Reply::Output(checks_failed("error two")));
        let report = harness
            .run(&config(2, 5, 10.0), &executor, &FixedCostEstimator::new(0.1))
            .await;

        assert_eq!(report.status, HealingStatus::IterationsExhausted);
        assert_eq!(report.iterations, 2);
        assert_eq!(executor.call_count("generate_fix"), 1);
        assert_eq!(harness.gates(), ["iterations_exhausted"]);
    }

    #[tokio::test]
    async fn retargeting_resets_the_repeat_streak() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::new()
            .always("run_checks", Reply::Output(checks_failed("test foo failed")))
            .then(
                "diagnose",
                Reply::Output(CapabilityOutput::success(
                    json!({"summary": "bug is in helper", "target_file": "src/helper.rs"}),
                )),
            )
            .always("diagnose", Reply::Output(CapabilityOutput::success(json!({"summary": "still failing"}))))
            .always("generate_fix", Reply::Output(CapabilityOutput::success(Value::Null)));
        let report = harness
            .run(&config(5, 1, 10.0), &executor, &FixedCostEstimator::new(0.1))
            .await;

        // Without the reset the second identical failure would stop the loop.
        assert_eq!(report.status, HealingStatus::LoopDetected);
        assert_eq!(report.verification_calls, 3);
        assert_eq!(report.target_file, "src/helper.rs");
        assert_eq!(harness.gates(), ["retarget", "loop_detected"]);
        let fixes = executor.calls_for("generate_fix");
        assert_eq!(fixes[0].params["target_file"], "src/helper.rs");
    }

    #[tokio::test]
    async fn verification_timeout_counts_as_failure() {
        let harness = Harness::new();
        let executor = executor().always("run_checks", Reply::Hang);
        let config = HealingConfig {
            iteration_timeout: Duration::from_millis(20),
            ..config(3, 1, 10.0)
        };
        let report = harness.run(&config, &executor, &FixedCostEstimator::new(0.0)).await;
        assert_eq!(report.status, HealingStatus::LoopDetected);
        assert!(report.last_failure.expect("failure").contains("timed out"));
    }

    #[tokio::test]
    async fn failed_diagnosis_falls_back_to_raw_failure() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::new()
            .always("run_checks", Reply::Output(checks_failed("test foo failed")))
            .always("diagnose", Reply::Error(CapabilityError::Failed("model offline".into())))
            .always("generate_fix", Reply::Output(CapabilityOutput::success(Value::Null)));
        let report = harness
            .run(&config(3, 1, 10.0), &executor, &FixedCostEstimator::new(0.0))
            .await;
        assert_eq!(report.last_diagnosis.as_deref(), Some("test foo failed"));
        let fixes = executor.calls_for("generate_fix");
        assert_eq!(fixes[0].params["diagnosis"], "test foo failed");
    }

    #[tokio::test]
    async fn cancellation_stops_the_session() {
        let harness = Harness::new();
        let executor = executor().always("run_checks", Reply::Output(checks_failed("x")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = config(3, 1, 10.0);
        let report = HealingLoop::new(&config, &executor, &FixedCostEstimator::new(0.0), &harness.tracer)
            .run(harness.task_id, "src/lib.rs".into(), &Value::Null, &cancel)
            .await;
        assert_eq!(report.status, HealingStatus::Cancelled);
        assert_eq!(report.verification_calls, 0);
        let trace = harness.tracer.snapshot(harness.task_id).expect("trace");
        assert_eq!(trace.state, TaskState::Processing);
        assert_eq!(trace.steps.last().expect("step").status, StepStatus::Error);
    }

    #[test]
    fn diagnosis_parses_objects_strings_and_text() {
        let object = Diagnosis::from_output(&json!({"summary": "s", "target_file": "a.rs"}))
            .expect("object");
        assert_eq!(object.target_file.as_deref(), Some("a.rs"));
        let embedded = Diagnosis::from_output(&json!("{\"summary\": \"inner\"}")).expect("string");
        assert_eq!(embedded.summary, "inner");
        let text = Diagnosis::from_output(&json!("just words")).expect("text");
        assert_eq!(text.summary, "just words");
        assert!(Diagnosis::from_output(&json!({"summary": " "})).is_none());
        assert!(Diagnosis::from_output(&Value::Null).is_none());
    }

    #[test]
    fn verify_params_merge_payload_params() {
        let merged = with_fields(&json!({"args": ["--quick"]}), [("target_file", json!("a.rs"))]);
        assert_eq!(merged, json!({"args": ["--quick"], "target_file": "a.rs"}));
        let wrapped = with_fields(&json!("raw"), [("iteration", json!(1))]);
        assert_eq!(wrapped, json!({"params": "raw", "iteration": 1}));
    }
}
