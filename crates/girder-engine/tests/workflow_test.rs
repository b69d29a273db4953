//! Workflow runner tests: routing, parallel scheduling, boundaries

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use girder_core::workflow::{
    ErrorPolicy, ExecutionMode, Step, StepDisposition, StepResult, Workflow, WorkflowStatus,
};
use girder_core::{
    handler_fn, params, Backoff, ErrorCategory, HandlerRegistry, Params, RetryPolicy,
};
use girder_engine::{
    register_workflow, DirectRunnable, Dispatcher, DispatcherConfig, MemoryExecutor,
    RunnerConfig, WorkflowRunner,
};
use girder_storage::MemoryStore;

fn runner_with(registry: &Arc<HandlerRegistry>) -> WorkflowRunner {
    WorkflowRunner::new(Arc::new(DirectRunnable::new(registry.clone())))
}

/// Registers an operation handler that records its invocation
fn tracing_op(registry: &Arc<HandlerRegistry>, name: &str, log: &Arc<Mutex<Vec<String>>>) {
    let log = log.clone();
    let tag = name.to_string();
    registry
        .register_operation(
            name,
            handler_fn(move |_| {
                log.lock().push(tag.clone());
                Ok(json!({"op": tag}))
            }),
        )
        .unwrap();
}

#[tokio::test]
async fn test_choice_routes_to_exactly_one_branch() {
    let registry = Arc::new(HandlerRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    for op in ["fetch", "heavy", "light"] {
        tracing_op(&registry, op, &log);
    }
    let runner = runner_with(&registry);

    let workflow = Workflow::new("route-demo")
        .add_step(Step::operation("fetch"))
        .add_step(Step::lambda("classify", |ctx| {
            let n = ctx.param("n").and_then(Value::as_i64).unwrap_or(0);
            StepResult::ok(json!({"big": n > 10}))
        }))
        .add_step(Step::choice(
            "route",
            |ctx| ctx.get("classify", "big", json!(false)) == json!(true),
            "heavy",
            "light",
        ))
        .add_step(Step::operation("heavy"))
        .add_step(Step::operation("light"));

    let result = runner
        .execute(&workflow, params([("n", json!(20))]))
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.step_names(), vec!["fetch", "classify", "route", "heavy"]);
    assert!(result.outputs.contains_key("heavy"));
    assert!(!result.outputs.contains_key("light"));
    assert_eq!(*log.lock(), vec!["fetch", "heavy"]);
}

#[tokio::test]
async fn test_choice_takes_else_branch_on_false() {
    let registry = Arc::new(HandlerRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    for op in ["fetch", "heavy", "light"] {
        tracing_op(&registry, op, &log);
    }
    let runner = runner_with(&registry);

    let workflow = Workflow::new("route-demo")
        .add_step(Step::operation("fetch"))
        .add_step(Step::choice(
            "route",
            |ctx| ctx.param("n").and_then(Value::as_i64).unwrap_or(0) > 10,
            "heavy",
            "light",
        ))
        .add_step(Step::operation("heavy"))
        .add_step(Step::operation("light"));

    let result = runner.execute(&workflow, params([("n", json!(3))])).await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    // The jump to `light` skips `heavy`, which is also the excluded branch.
    assert_eq!(result.step_names(), vec!["fetch", "route", "light"]);
    assert_eq!(*log.lock(), vec!["fetch", "light"]);
}

#[tokio::test]
async fn test_parallel_fan_out_respects_concurrency_cap() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let mut workflow = Workflow::new("fan-out")
        .with_mode(ExecutionMode::Parallel)
        .with_max_concurrency(2)
        .add_step(Step::lambda("source", |_| StepResult::ok(json!("ready"))));
    for i in 0..5 {
        workflow = workflow.add_step(
            Step::wait(format!("sleep-{i}"), Duration::from_millis(100))
                .with_depends_on(["source"]),
        );
    }

    let started = Instant::now();
    let result = runner.execute(&workflow, Params::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.completed_steps.len(), 6);
    // Five 100ms sleeps under a cap of two: three batches.
    assert!(elapsed >= Duration::from_millis(250), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(450), "elapsed {elapsed:?}");
    for i in 0..5 {
        assert!(result.outputs.contains_key(&format!("sleep-{i}")));
    }
}

#[tokio::test]
async fn test_parallel_waits_for_all_dependencies() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |order: &Arc<Mutex<Vec<String>>>, name: &str| {
        let order = order.clone();
        let name = name.to_string();
        move |_ctx: &girder_core::workflow::WorkflowContext| {
            order.lock().push(name.clone());
            StepResult::ok(json!(null))
        }
    };

    let workflow = Workflow::new("diamond")
        .with_mode(ExecutionMode::Parallel)
        .add_step(Step::lambda("src", record(&order, "src")))
        .add_step(Step::lambda("left", record(&order, "left")).with_depends_on(["src"]))
        .add_step(Step::lambda("right", record(&order, "right")).with_depends_on(["src"]))
        .add_step(
            Step::lambda("join", record(&order, "join")).with_depends_on(["left", "right"]),
        );

    let result = runner.execute(&workflow, Params::new()).await;
    assert_eq!(result.status, WorkflowStatus::Completed);

    let order = order.lock().clone();
    assert_eq!(order.first().map(String::as_str), Some("src"));
    assert_eq!(order.last().map(String::as_str), Some("join"));
}

#[tokio::test]
async fn test_empty_workflow_completes_immediately() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
        let workflow = Workflow::new("empty").with_mode(mode);
        let result = runner.execute(&workflow, Params::new()).await;
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.completed_steps.is_empty());
        assert!(result.outputs.is_empty());
    }
}

#[tokio::test]
async fn test_single_step_identical_in_both_modes() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let mut outcomes = vec![];
    for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
        let workflow = Workflow::new("single")
            .with_mode(mode)
            .add_step(Step::lambda("only", |_| StepResult::ok(json!({"v": 1}))));
        let result = runner.execute(&workflow, Params::new()).await;
        outcomes.push((result.status, result.step_names().join(","), result.outputs));
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn test_zero_timeout_step_fails_with_timeout() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let workflow = Workflow::new("deadline").add_step(
        Step::wait("long-wait", Duration::from_secs(5)).with_timeout_seconds(0),
    );

    let result = runner.execute(&workflow, Params::new()).await;
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error_step.as_deref(), Some("long-wait"));
    assert!(result.error.unwrap().contains("deadline"));
}

#[tokio::test]
async fn test_continue_policy_records_failure_and_proceeds() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let workflow = Workflow::new("lenient")
        .add_step(
            Step::lambda("shaky", |_| {
                StepResult::fail("bad rows", ErrorCategory::DataQuality)
            })
            .with_error_policy(ErrorPolicy::Continue),
        )
        .add_step(Step::lambda("after", |_| StepResult::ok(json!("ran"))));

    let result = runner.execute(&workflow, Params::new()).await;
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.completed_steps.len(), 2);
    assert_eq!(
        result.completed_steps[0].disposition,
        StepDisposition::Failed
    );
    assert!(result.outputs.contains_key("after"));
    assert!(!result.outputs.contains_key("shaky"));
}

#[tokio::test]
async fn test_stop_policy_attributes_error_to_step() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let workflow = Workflow::new("strict")
        .add_step(Step::lambda("boom", |_| {
            StepResult::fail("exploded", ErrorCategory::Internal)
        }))
        .add_step(Step::lambda("never", |_| StepResult::ok(json!(null))));

    let result = runner.execute(&workflow, Params::new()).await;
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error_step.as_deref(), Some("boom"));
    assert_eq!(result.error.as_deref(), Some("exploded"));
    assert_eq!(result.completed_steps.len(), 1);
}

#[tokio::test]
async fn test_step_retry_policy_applies() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let workflow = Workflow::new("retrying").add_step(
        Step::lambda("flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                StepResult::fail("not yet", ErrorCategory::Transient)
            } else {
                StepResult::ok(json!("third time"))
            }
        })
        .with_retry_policy(
            RetryPolicy::new(3, Backoff::constant(Duration::ZERO)).with_jitter(false),
        ),
    );

    let result = runner.execute(&workflow, Params::new()).await;
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.completed_steps[0].attempts, 3);
}

#[tokio::test]
async fn test_map_step_fans_over_items() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let workflow = Workflow::new("mapper").add_step(Step::map(
        "double-all",
        |ctx| {
            ctx.param("values")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        },
        vec![Step::lambda("double", |ctx| {
            let n = ctx.param("item").and_then(Value::as_i64).unwrap_or(0);
            StepResult::ok(json!(n * 2))
        })],
    ));

    let result = runner
        .execute(&workflow, params([("values", json!([1, 2, 3]))]))
        .await;
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(
        result.outputs["double-all"],
        json!([{"double": 2}, {"double": 4}, {"double": 6}])
    );
}

#[tokio::test]
async fn test_cancelled_token_stops_before_first_step() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let workflow = Workflow::new("cancellable")
        .add_step(Step::lambda("never", |_| StepResult::ok(json!(null))));

    let token = CancellationToken::new();
    token.cancel();
    let result = runner
        .execute_with(&workflow, Params::new(), token, None)
        .await;
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert!(result.completed_steps.is_empty());
}

#[tokio::test]
async fn test_workflow_cycle_fails_validation() {
    let registry = Arc::new(HandlerRegistry::new());
    let runner = runner_with(&registry);

    let workflow = Workflow::new("cyclic")
        .add_step(Step::operation("a").with_depends_on(["b"]))
        .add_step(Step::operation("b").with_depends_on(["a"]));

    let result = runner.execute(&workflow, Params::new()).await;
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.unwrap().contains("cycle"));
}

#[tokio::test]
async fn test_registered_workflow_runs_through_dispatcher() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    tracing_op(&registry, "ingest", &log);

    let runner = Arc::new(WorkflowRunner::with_config(
        Arc::new(DirectRunnable::new(registry.clone())),
        RunnerConfig::default(),
    ));
    let workflow = Workflow::new("nightly").add_step(Step::operation("ingest"));
    register_workflow(&registry, runner, workflow).unwrap();

    let dispatcher = Dispatcher::new(
        store,
        registry,
        Arc::new(MemoryExecutor::new()),
        DispatcherConfig::default(),
    );
    let run_id = dispatcher
        .submit_workflow("nightly", Params::new())
        .await
        .unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(run.status, girder_core::RunStatus::Completed);
    let output = run.output.unwrap();
    assert_eq!(output["steps"], json!(["ingest"]));
    assert_eq!(*log.lock(), vec!["ingest"]);
}
