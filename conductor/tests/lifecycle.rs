//! End-to-end lifecycle tests: routing, healing sessions, panics and the
//! watchdog, driven through the public orchestrator API.

use std::time::Duration;

use conductor::core::types::{FailureReason, StepStatus, TaskState};
use conductor::healing::HealingConfig;
use conductor::io::capability::CapabilityOutput;
use conductor::orchestrator::OrchestratorConfig;
use conductor::queue::QueueConfig;
use conductor::test_support::{
    FixedCostEstimator, Fixture, Reply, ScriptedExecutor, checks_failed, code_fix_payload,
    payload, wait_for_state, wait_for_terminal,
};
use conductor::watchdog::{Watchdog, WatchdogConfig};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn healing_fixture(executor: ScriptedExecutor, healing: HealingConfig, estimate: f64) -> Fixture {
    Fixture::with_config(
        executor,
        QueueConfig {
            concurrency_limit: 2,
            max_pending: None,
        },
        OrchestratorConfig {
            executor_timeout: Duration::from_secs(5),
            healing,
        },
        FixedCostEstimator::new(estimate),
    )
}

fn healing_config(max_iterations: u32, max_repeat: u32, max_cost: f64) -> HealingConfig {
    HealingConfig {
        max_iterations,
        max_repeat,
        max_cost,
        iteration_timeout: Duration::from_secs(5),
        ..HealingConfig::default()
    }
}

fn with_fix_capabilities(executor: ScriptedExecutor) -> ScriptedExecutor {
    executor
        .always(
            "diagnose",
            Reply::Output(CapabilityOutput::success(json!({"summary": "assertion off by one"}))),
        )
        .always("generate_fix", Reply::Output(CapabilityOutput::success(Value::Null)))
}

/// Observed lifecycle events per task are a subsequence of
/// created -> started -> exactly one terminal event.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_events_only_move_forward() {
    let executor = ScriptedExecutor::new()
        .always("git", Reply::Output(CapabilityOutput::success(json!("done"))))
        .always("browser", Reply::Output(CapabilityOutput::failure("timeout loading page")))
        .always("llm.generate", Reply::Panic("model exploded"));
    let fixture = Fixture::new(executor, 2);
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let mut ids = Vec::new();
    for intent in ["git", "browse", "generate", "teleport"].repeat(3) {
        ids.push(orchestrator.submit(payload(intent)).expect("submit"));
    }
    for id in &ids {
        assert!(wait_for_terminal(orchestrator, *id, WAIT).await.is_some());
    }

    let rank = |kind: &str| match kind {
        "task_created" => 0,
        "task_started" => 1,
        _ => 2,
    };
    for id in &ids {
        let kinds = fixture.notifier.lifecycle_kinds(*id);
        let ranks: Vec<u8> = kinds.iter().map(|kind| rank(*kind)).collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]), "{kinds:?}");
        assert_eq!(ranks.iter().filter(|r| **r == 2).count(), 1, "{kinds:?}");
    }

    let trace = orchestrator.trace(ids[0]).expect("trace");
    assert_eq!(trace.state, TaskState::Completed);
}

#[tokio::test]
async fn unknown_intent_fails_with_typed_reason() {
    let fixture = Fixture::new(ScriptedExecutor::new(), 1);
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let id = orchestrator
        .submit(json!({"intent": "summon", "params": {}}))
        .expect("submit");
    assert_eq!(wait_for_terminal(orchestrator, id, WAIT).await, Some(TaskState::Failed));
    let task = orchestrator.task(id).expect("task");
    assert_eq!(task.reason, Some(FailureReason::UnknownIntent));
    assert_eq!(task.detail.as_deref(), Some("unknown intent 'summon'"));

    let trace = orchestrator.trace(id).expect("trace");
    let gate = trace.decision_gates().last().expect("gate");
    assert_eq!(gate.status, StepStatus::Error);
    assert!(fixture.executor.calls().is_empty());
}

#[tokio::test]
async fn panicking_capability_fails_task_and_frees_slot() {
    let executor = ScriptedExecutor::new()
        .then("git", Reply::Panic("boom"))
        .always("git", Reply::Output(CapabilityOutput::success(json!("ok"))));
    let fixture = Fixture::new(executor, 1);
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let first = orchestrator.submit(payload("git")).expect("first");
    let second = orchestrator.submit(payload("git")).expect("second");

    assert_eq!(wait_for_terminal(orchestrator, first, WAIT).await, Some(TaskState::Failed));
    let task = orchestrator.task(first).expect("task");
    assert_eq!(task.reason, Some(FailureReason::WorkerPanicked));
    assert_eq!(task.detail.as_deref(), Some("boom"));

    assert_eq!(
        wait_for_terminal(orchestrator, second, WAIT).await,
        Some(TaskState::Completed)
    );
}

#[tokio::test]
async fn executor_timeout_fails_direct_task() {
    let executor = ScriptedExecutor::new().always("file.edit", Reply::Hang);
    let fixture = Fixture::with_config(
        executor,
        QueueConfig::default(),
        OrchestratorConfig {
            executor_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        },
        FixedCostEstimator::new(0.0),
    );
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let id = orchestrator.submit(payload("file_edit")).expect("submit");
    assert_eq!(wait_for_terminal(orchestrator, id, WAIT).await, Some(TaskState::Failed));
    assert_eq!(
        orchestrator.task(id).expect("task").reason,
        Some(FailureReason::Timeout)
    );
}

/// `max_iterations = 3`, `max_repeat = 1` and identical failures stop with
/// `loop_detected` after exactly two verification calls.
#[tokio::test]
async fn repeated_failure_stops_healing_with_loop_detected() {
    let executor = with_fix_capabilities(
        ScriptedExecutor::new().always("run_checks", Reply::Output(checks_failed("test foo failed"))),
    );
    let fixture = healing_fixture(executor, healing_config(3, 1, 10.0), 0.1);
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let id = orchestrator.submit(code_fix_payload("src/lib.rs")).expect("submit");
    assert_eq!(wait_for_terminal(orchestrator, id, WAIT).await, Some(TaskState::Failed));

    let task = orchestrator.task(id).expect("task");
    assert_eq!(task.reason, Some(FailureReason::LoopDetected));
    assert_eq!(task.detail.as_deref(), Some("assertion off by one"));
    assert_eq!(fixture.executor.call_count("run_checks"), 2);

    let trace = orchestrator.trace(id).expect("trace");
    let gates: Vec<&str> = trace.decision_gates().map(|s| s.action.as_str()).collect();
    assert_eq!(gates, ["route", "loop_detected"]);
}

#[tokio::test]
async fn budget_guard_fails_task_before_paying_for_a_fix() {
    let executor = with_fix_capabilities(
        ScriptedExecutor::new().always("run_checks", Reply::Output(checks_failed("test foo failed"))),
    );
    let fixture = healing_fixture(executor, healing_config(3, 2, 0.05), 0.1);
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let id = orchestrator.submit(code_fix_payload("src/lib.rs")).expect("submit");
    assert_eq!(wait_for_terminal(orchestrator, id, WAIT).await, Some(TaskState::Failed));
    assert_eq!(
        orchestrator.task(id).expect("task").reason,
        Some(FailureReason::BudgetExceeded)
    );
    assert_eq!(fixture.executor.call_count("generate_fix"), 0);
}

#[tokio::test]
async fn successful_healing_completes_with_report() {
    let executor = with_fix_capabilities(
        ScriptedExecutor::new()
            .then("run_checks", Reply::Output(checks_failed("test foo failed")))
            .always("run_checks", Reply::Output(CapabilityOutput::success(json!("all green")))),
    );
    let fixture = healing_fixture(executor, healing_config(3, 2, 1.0), 0.2);
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let id = orchestrator.submit(code_fix_payload("src/lib.rs")).expect("submit");
    assert_eq!(wait_for_terminal(orchestrator, id, WAIT).await, Some(TaskState::Completed));

    let output = orchestrator.task(id).expect("task").output.expect("report");
    assert_eq!(output["status"], "success");
    assert_eq!(output["iterations"], 2);
    assert_eq!(output["verification_calls"], 2);
    assert_eq!(output["cumulative_cost"], 0.2);
}

/// A task whose worker never returns is LOST within a sweep interval after
/// the stall timeout, and its slot goes to the next task.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_recovers_slot_from_silent_task() {
    let executor = ScriptedExecutor::new()
        .then("git", Reply::Hang)
        .always("git", Reply::Output(CapabilityOutput::success(json!("ok"))));
    let fixture = Fixture::with_config(
        executor,
        QueueConfig {
            concurrency_limit: 1,
            max_pending: None,
        },
        OrchestratorConfig {
            executor_timeout: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        },
        FixedCostEstimator::new(0.0),
    );
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let stuck = orchestrator.submit(payload("git")).expect("stuck");
    let next = orchestrator.submit(payload("git")).expect("next");
    assert!(wait_for_state(orchestrator, stuck, TaskState::Processing, WAIT).await);

    let shutdown = CancellationToken::new();
    let watchdog = Watchdog::new(
        orchestrator.clone(),
        WatchdogConfig {
            interval: Duration::from_millis(25),
            stall_timeout: Duration::from_millis(150),
        },
    )
    .spawn(shutdown.clone());

    assert!(wait_for_state(orchestrator, stuck, TaskState::Lost, WAIT).await);
    assert_eq!(
        wait_for_terminal(orchestrator, next, WAIT).await,
        Some(TaskState::Completed)
    );
    assert_eq!(
        fixture.notifier.lifecycle_kinds(stuck),
        ["task_created", "task_started", "task_lost"]
    );
    // The cancelled worker finishing later must not overwrite LOST.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.task(stuck).expect("task").state, TaskState::Lost);

    shutdown.cancel();
    watchdog.await.expect("watchdog join");
}

/// A worker blocked on its thread ignores both its deadline and its token;
/// the watchdog still declares it LOST and hands the slot on, and the late
/// return does not overwrite LOST.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watchdog_recovers_slot_from_blocked_worker() {
    let executor = ScriptedExecutor::new()
        .then("git", Reply::Stuck(Duration::from_secs(1)))
        .always("git", Reply::Output(CapabilityOutput::success(json!("ok"))));
    let fixture = Fixture::with_config(
        executor,
        QueueConfig {
            concurrency_limit: 1,
            max_pending: None,
        },
        OrchestratorConfig {
            executor_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        },
        FixedCostEstimator::new(0.0),
    );
    let orchestrator = &fixture.orchestrator;
    orchestrator.start();

    let stuck = orchestrator.submit(payload("git")).expect("stuck");
    let next = orchestrator.submit(payload("git")).expect("next");
    assert!(wait_for_state(orchestrator, stuck, TaskState::Processing, WAIT).await);

    let shutdown = CancellationToken::new();
    let watchdog = Watchdog::new(
        orchestrator.clone(),
        WatchdogConfig {
            interval: Duration::from_millis(25),
            stall_timeout: Duration::from_millis(150),
        },
    )
    .spawn(shutdown.clone());

    assert!(wait_for_state(orchestrator, stuck, TaskState::Lost, WAIT).await);
    assert_eq!(
        wait_for_terminal(orchestrator, next, WAIT).await,
        Some(TaskState::Completed)
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(orchestrator.task(stuck).expect("task").state, TaskState::Lost);
    assert_eq!(
        fixture.notifier.lifecycle_kinds(stuck),
        ["task_created", "task_started", "task_lost"]
    );

    shutdown.cancel();
    watchdog.await.expect("watchdog join");
}

#[tokio::test]
async fn shutdown_stops_dispatcher_and_rejects_new_work() {
    let fixture = Fixture::new(ScriptedExecutor::new(), 1);
    let orchestrator = &fixture.orchestrator;
    let dispatcher = orchestrator.start();

    orchestrator.shutdown();
    tokio::time::timeout(WAIT, dispatcher)
        .await
        .expect("dispatcher exits")
        .expect("join");
    assert!(orchestrator.submit(payload("git")).is_err());
    let tasks = orchestrator.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Aborted);
    assert_eq!(tasks[0].reason, Some(FailureReason::Rejected));
}
