//! End-to-end dispatcher tests against the in-memory store

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use girder_core::{
    async_handler_fn, handler_fn, params, Backoff, HandlerRegistry, Params, RetryPolicy,
    RunEventType, RunStatus, WorkError, WorkSpec,
};
use girder_engine::{
    AsyncLocalExecutor, DispatchError, Dispatcher, DispatcherConfig, Executor, MemoryExecutor,
};
use girder_storage::{DlqFilter, ExecutionStore, MemoryStore, StoreError};

fn harness(executor: Arc<dyn Executor>) -> (Dispatcher, Arc<MemoryStore>, Arc<HandlerRegistry>) {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry.clone(),
        executor,
        DispatcherConfig::default(),
    );
    (dispatcher, store, registry)
}

fn instant_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Backoff::constant(Duration::ZERO)).with_jitter(false)
}

async fn wait_for_status(
    store: &MemoryStore,
    run_id: girder_core::RunId,
    status: RunStatus,
) {
    for _ in 0..200 {
        if store.get_run(run_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached {status}");
}

#[tokio::test]
async fn test_basic_submission_and_completion() {
    let (dispatcher, store, registry) = harness(Arc::new(MemoryExecutor::new()));
    registry
        .register_task(
            "echo",
            handler_fn(|p| Ok(json!({ "echo": p.get("x").cloned().unwrap_or(json!(null)) }))),
        )
        .unwrap();

    let run_id = dispatcher
        .submit_task("echo", params([("x", json!(42))]))
        .await
        .unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({"echo": 42})));
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());

    let types: Vec<_> = store
        .load_events(run_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    for expected in [
        RunEventType::Submitted,
        RunEventType::Started,
        RunEventType::Completed,
    ] {
        assert!(types.contains(&expected), "missing {expected}");
    }
}

#[tokio::test]
async fn test_idempotency_short_circuit() {
    let (dispatcher, store, registry) = harness(Arc::new(MemoryExecutor::new()));
    registry
        .register_task("noop", handler_fn(|_| Ok(json!({"ok": true}))))
        .unwrap();

    let spec = WorkSpec::task("noop", Params::new()).with_idempotency_key("K1");
    let first = dispatcher.submit(spec.clone()).await.unwrap();
    dispatcher
        .wait_for_settled(first, Duration::from_secs(1))
        .await
        .unwrap();

    let second = dispatcher.submit(spec).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.run_count(), 1);

    let completions = store
        .load_events(first)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == RunEventType::Completed)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_retry_then_exhaust_to_dlq() {
    let (dispatcher, store, registry) = harness(Arc::new(MemoryExecutor::new()));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    registry
        .register_task(
            "flaky",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WorkError::transient("downstream reset"))
            }),
        )
        .unwrap();

    let spec = WorkSpec::task("flaky", Params::new()).with_retry_policy(instant_retry(2));
    let run_id = dispatcher.submit(spec).await.unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::DeadLettered);
    assert_eq!(run.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let events = store.load_events(run_id).await.unwrap();
    let count =
        |t: RunEventType| events.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count(RunEventType::Retrying), 2);
    assert_eq!(count(RunEventType::DeadLettered), 1);
    assert_eq!(count(RunEventType::Started), 3);

    let dlq = store.list_dlq(&DlqFilter::unresolved()).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].run_id, run_id);
    assert_eq!(dlq[0].retry_attempts, 2);
}

#[tokio::test]
async fn test_non_retryable_error_dead_letters_immediately() {
    let (dispatcher, store, registry) = harness(Arc::new(MemoryExecutor::new()));
    registry
        .register_task(
            "strict",
            handler_fn(|_| Err(WorkError::validation("bad shape"))),
        )
        .unwrap();

    let spec = WorkSpec::task("strict", Params::new()).with_retry_policy(instant_retry(5));
    let run_id = dispatcher.submit(spec).await.unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::DeadLettered);
    assert_eq!(run.retry_count, 0);
    let dlq = store.list_dlq(&DlqFilter::unresolved()).await.unwrap();
    assert_eq!(dlq[0].retry_attempts, 0);
}

#[tokio::test]
async fn test_handler_not_found_is_dead_lettered() {
    let (dispatcher, store, _registry) = harness(Arc::new(MemoryExecutor::new()));

    let run_id = dispatcher
        .submit_task("ghost", Params::new())
        .await
        .unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::DeadLettered);
    assert!(run.error.unwrap().contains("HANDLER_NOT_FOUND"));
    assert_eq!(store.dlq_count(), 1);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let (dispatcher, store, registry) = harness(Arc::new(AsyncLocalExecutor::new(2)));
    registry
        .register_task(
            "slow",
            async_handler_fn(|_p| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            }),
        )
        .unwrap();

    let run_id = dispatcher.submit_task("slow", Params::new()).await.unwrap();
    wait_for_status(&store, run_id, RunStatus::Running).await;

    assert!(dispatcher.cancel(run_id).await.unwrap());
    assert!(!dispatcher.cancel(run_id).await.unwrap());

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let events = store.load_events(run_id).await.unwrap();
    let cancels = events
        .iter()
        .filter(|e| e.event_type == RunEventType::Cancelled)
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn test_cancel_of_completed_run_is_a_noop() {
    let (dispatcher, _store, registry) = harness(Arc::new(MemoryExecutor::new()));
    registry
        .register_task("quick", handler_fn(|_| Ok(json!(1))))
        .unwrap();

    let run_id = dispatcher
        .submit_task("quick", Params::new())
        .await
        .unwrap();
    dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!dispatcher.cancel(run_id).await.unwrap());
}

#[tokio::test]
async fn test_retry_from_dlq_runs_again_and_resolves_once() {
    let (dispatcher, store, registry) = harness(Arc::new(MemoryExecutor::new()));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    registry
        .register_task(
            "heals",
            handler_fn(move |_| {
                // Fails on the first pass, succeeds after re-queue.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(WorkError::transient("first pass fails"))
                } else {
                    Ok(json!({"healed": true}))
                }
            }),
        )
        .unwrap();

    let spec = WorkSpec::task("heals", Params::new()).with_retry_policy(instant_retry(0));
    let run_id = dispatcher.submit(spec).await.unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::DeadLettered);

    let dlq_id = store.list_dlq(&DlqFilter::unresolved()).await.unwrap()[0].dlq_id;
    let requeued = dispatcher.retry_from_dlq(dlq_id, "operator").await.unwrap();
    assert_eq!(requeued, run_id);
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    // Resolving the same entry twice fails.
    let second = dispatcher.retry_from_dlq(dlq_id, "operator").await;
    assert!(matches!(
        second,
        Err(DispatchError::Store(StoreError::AlreadyResolved(_)))
    ));
}

#[tokio::test]
async fn test_at_most_once_completion_under_concurrent_duplicates() {
    let (dispatcher, store, registry) = harness(Arc::new(AsyncLocalExecutor::new(4)));
    let executions = Arc::new(AtomicU32::new(0));
    let counter = executions.clone();
    registry
        .register_task(
            "dedup",
            async_handler_fn(move |_p| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({"done": true}))
                }
            }),
        )
        .unwrap();

    let mut handles = vec![];
    for _ in 0..5 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let spec = WorkSpec::task("dedup", Params::new()).with_idempotency_key("K-CONC");
            dispatcher.submit(spec).await
        }));
    }

    let mut winners = vec![];
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(run_id) => winners.push(run_id),
            Err(DispatchError::AlreadyRunning { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(!winners.is_empty());
    winners.sort();
    winners.dedup();
    assert_eq!(winners.len(), 1, "duplicates must fold onto one run");
    assert_eq!(winners.len() + rejected, 5);

    let run = dispatcher
        .wait_for_settled(winners[0], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let completed: Vec<_> = store
        .list_runs(&girder_storage::RunFilter::default().with_status(RunStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);

    // Resubmitting after completion short-circuits to the same run.
    let spec = WorkSpec::task("dedup", Params::new()).with_idempotency_key("K-CONC");
    let again = dispatcher.submit(spec).await.unwrap();
    assert_eq!(again, winners[0]);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_submission_returns_output() {
    let (dispatcher, _store, registry) = harness(Arc::new(MemoryExecutor::new()));
    registry
        .register_operation(
            "sum",
            handler_fn(|p| {
                let a = p.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                let b = p.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!({"sum": a + b}))
            }),
        )
        .unwrap();

    let run = dispatcher
        .submit_operation_sync("sum", params([("a", json!(2)), ("b", json!(3))]))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({"sum": 5})));
}

#[tokio::test]
async fn test_lock_released_after_terminal_state() {
    let (dispatcher, store, registry) = harness(Arc::new(MemoryExecutor::new()));
    registry
        .register_task("once", handler_fn(|_| Ok(json!(null))))
        .unwrap();

    let run_id = dispatcher.submit_task("once", Params::new()).await.unwrap();
    dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();

    // Give the completion loop a beat to release the lock.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.list_active_locks().await.unwrap().is_empty());
}
