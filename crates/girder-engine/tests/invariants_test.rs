//! Quantified invariants over the ledger and resilience primitives

use std::sync::Arc;
use std::time::Duration;

use girder_core::{
    handler_fn, Backoff, Params, RetryPolicy, RunEventType, RunId, RunStatus, WorkError,
    WorkSpec,
};
use girder_engine::{Dispatcher, DispatcherConfig, MemoryExecutor};
use girder_storage::{ExecutionStore, MemoryStore, TransitionCtx};

/// Status implied by a lifecycle event, for replaying the event log
fn implied_status(event: RunEventType) -> Option<RunStatus> {
    match event {
        RunEventType::Submitted | RunEventType::Retrying => Some(RunStatus::Pending),
        RunEventType::Queued => Some(RunStatus::Queued),
        RunEventType::Started => Some(RunStatus::Running),
        RunEventType::Completed => Some(RunStatus::Completed),
        RunEventType::Failed => Some(RunStatus::Failed),
        RunEventType::Cancelled => Some(RunStatus::Cancelled),
        RunEventType::DeadLettered => Some(RunStatus::DeadLettered),
        RunEventType::Progress
        | RunEventType::Reconciled
        | RunEventType::OrphanDetected => None,
    }
}

/// Every consecutive pair of status-bearing events must be a legal
/// transition.
async fn assert_event_log_respects_state_machine(store: &MemoryStore, run_id: RunId) {
    let statuses: Vec<RunStatus> = store
        .load_events(run_id)
        .await
        .unwrap()
        .iter()
        .filter_map(|e| implied_status(e.event_type))
        .collect();
    for pair in statuses.windows(2) {
        assert!(
            RunStatus::validate_transition(pair[0], pair[1]).is_ok(),
            "illegal transition {} -> {} recovered from event log",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_event_log_replays_to_legal_status_history() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(girder_core::HandlerRegistry::new());
    let flaky_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = flaky_calls.clone();
    registry
        .register_task(
            "eventually",
            handler_fn(move |_| {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                    Err(WorkError::transient("warming up"))
                } else {
                    Ok(serde_json::json!("warm"))
                }
            }),
        )
        .unwrap();

    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        Arc::new(MemoryExecutor::new()),
        DispatcherConfig::default(),
    );
    let spec = WorkSpec::task("eventually", Params::new()).with_retry_policy(
        RetryPolicy::new(3, Backoff::constant(Duration::ZERO)).with_jitter(false),
    );
    let run_id = dispatcher.submit(spec).await.unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_event_log_respects_state_machine(&store, run_id).await;
}

#[tokio::test]
async fn test_event_timestamps_never_regress() {
    let store = Arc::new(MemoryStore::new());
    let run_id = RunId::generate();
    store
        .create_run(run_id, &WorkSpec::task("t", Params::new()), None)
        .await
        .unwrap();
    store
        .update_status(run_id, RunStatus::Running, TransitionCtx::default())
        .await
        .unwrap();
    for i in 0..50 {
        store
            .record_event(
                run_id,
                RunEventType::Progress,
                Some(serde_json::json!({ "i": i })),
            )
            .await
            .unwrap();
    }
    store
        .update_status(run_id, RunStatus::Completed, TransitionCtx::default())
        .await
        .unwrap();

    let events = store.load_events(run_id).await.unwrap();
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn test_terminal_states_are_irrevocable() {
    let store = MemoryStore::new();

    for terminal in [RunStatus::Completed, RunStatus::Cancelled] {
        let run_id = RunId::generate();
        store
            .create_run(run_id, &WorkSpec::task("t", Params::new()), None)
            .await
            .unwrap();
        if terminal == RunStatus::Completed {
            store
                .update_status(run_id, RunStatus::Running, TransitionCtx::default())
                .await
                .unwrap();
        }
        store
            .update_status(run_id, terminal, TransitionCtx::default())
            .await
            .unwrap();

        for next in [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::DeadLettered,
        ] {
            let result = store
                .update_status(run_id, next, TransitionCtx::default())
                .await;
            assert!(result.is_err(), "{terminal} must not transition to {next}");
        }
        assert_eq!(store.get_run(run_id).await.unwrap().status, terminal);
    }
}

#[tokio::test]
async fn test_retry_count_bounded_by_policy() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(girder_core::HandlerRegistry::new());
    registry
        .register_task(
            "hopeless",
            handler_fn(|_| Err(WorkError::transient("never works"))),
        )
        .unwrap();

    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        Arc::new(MemoryExecutor::new()),
        DispatcherConfig::default(),
    );
    for max_retries in [0, 1, 3] {
        let spec = WorkSpec::task("hopeless", Params::new()).with_retry_policy(
            RetryPolicy::new(max_retries, Backoff::constant(Duration::ZERO)).with_jitter(false),
        );
        let run_id = dispatcher.submit(spec).await.unwrap();
        let run = dispatcher
            .wait_for_settled(run_id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::DeadLettered);
        assert!(run.retry_count <= max_retries);
        assert_eq!(run.retry_count, max_retries);
        assert_event_log_respects_state_machine(&store, run_id).await;
    }
}

#[tokio::test]
async fn test_zero_retries_dead_letters_on_first_failure() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(girder_core::HandlerRegistry::new());
    registry
        .register_task("once", handler_fn(|_| Err(WorkError::transient("no"))))
        .unwrap();

    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        Arc::new(MemoryExecutor::new()),
        DispatcherConfig::default(),
    );
    let spec = WorkSpec::task("once", Params::new()).with_retry_policy(RetryPolicy::none());
    let run_id = dispatcher.submit(spec).await.unwrap();
    let run = dispatcher
        .wait_for_settled(run_id, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::DeadLettered);
    assert_eq!(run.retry_count, 0);
    let retrying = store
        .load_events(run_id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == RunEventType::Retrying)
        .count();
    assert_eq!(retrying, 0);
}

#[tokio::test]
async fn test_lock_exclusivity_under_contention() {
    let store = Arc::new(MemoryStore::new());

    let mut handles = vec![];
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .try_acquire_lock("contended", RunId::generate(), Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let granted = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(granted, 1);
    assert_eq!(store.list_active_locks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dlq_rows_match_dead_lettered_runs() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(girder_core::HandlerRegistry::new());
    registry
        .register_task("doom", handler_fn(|_| Err(WorkError::validation("bad"))))
        .unwrap();

    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        Arc::new(MemoryExecutor::new()),
        DispatcherConfig::default(),
    );
    for _ in 0..3 {
        let run_id = dispatcher.submit_task("doom", Params::new()).await.unwrap();
        dispatcher
            .wait_for_settled(run_id, Duration::from_secs(1))
            .await
            .unwrap();
    }

    // Every unresolved DLQ row points at a DeadLettered run, and every
    // DeadLettered run has exactly one unresolved DLQ row.
    let unresolved = store
        .list_dlq(&girder_storage::DlqFilter::unresolved())
        .await
        .unwrap();
    assert_eq!(unresolved.len(), 3);
    for entry in &unresolved {
        let run = store.get_run(entry.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::DeadLettered);
    }
}
