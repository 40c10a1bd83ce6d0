//! Integration tests for the cleanup registry, signal bridge and
//! invocation adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_lambda_harness::lifecycle::{
    CleanupHandler, CleanupRegistry, Invocation, InvocationAdapter, LifecycleError, ReleaseOrder,
    SignalBridge, SyncHandler,
};
use serde_json::{json, Value};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn recording(log: &Arc<Mutex<Vec<usize>>>, id: usize, fail: bool) -> CleanupHandler {
    let log = Arc::clone(log);
    CleanupHandler::sync(format!("handler-{id}"), move || {
        log.lock().unwrap().push(id);
        if fail {
            Err(format!("handler {id} failed").into())
        } else {
            Ok(())
        }
    })
}

// ============================================================================
// Registry drain
// ============================================================================

#[test]
fn test_drain_runs_every_handler_once_in_order() {
    for n in [0usize, 1, 2, 5, 12] {
        for failing_every in [1usize, 2, 3, 7] {
            let registry = CleanupRegistry::new();
            let log = Arc::new(Mutex::new(Vec::new()));
            for id in 0..n {
                registry.register(recording(&log, id, id % failing_every == 0));
            }

            let report = registry.drain();

            let expected_failures = (0..n).filter(|id| id % failing_every == 0).count();
            assert_eq!(*log.lock().unwrap(), (0..n).collect::<Vec<_>>());
            assert_eq!(report.executed, n);
            assert_eq!(report.failures.len(), expected_failures);
            assert!(registry.is_empty());
        }
    }
}

#[test]
fn test_second_drain_is_noop() {
    let registry = CleanupRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    registry.register(CleanupHandler::sync("once", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let first = registry.drain();
    let second = registry.drain();

    assert_eq!(first.executed, 1);
    assert_eq!(second.executed, 0);
    assert!(second.is_clean());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failure_summary_on_request() {
    let registry = CleanupRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.register(recording(&log, 0, false));
    registry.register(recording(&log, 1, true));

    let err = registry.drain().into_result().unwrap_err();
    match err {
        LifecycleError::CleanupFailed {
            failed, executed, ..
        } => {
            assert_eq!(failed, 1);
            assert_eq!(executed, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_reverse_order_releases_dependents_first() {
    let registry = CleanupRegistry::with_order(ReleaseOrder::Reverse);
    let log = Arc::new(Mutex::new(Vec::new()));
    for id in 0..3 {
        registry.register(recording(&log, id, false));
    }

    registry.drain();
    assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_drain_from_runtime_worker() {
    let registry = CleanupRegistry::new();
    let done = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&done);
    registry.register(CleanupHandler::future("async", move || async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let report = registry.drain();

    assert_eq!(report.executed, 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Signal bridge
// ============================================================================

#[test]
fn test_rapid_signals_never_repeat_cleanup() {
    let registry = Arc::new(CleanupRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let runs = Arc::clone(&runs);
        registry.register(CleanupHandler::sync("slow", move || {
            std::thread::sleep(Duration::from_millis(15));
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }
    let bridge = Arc::new(SignalBridge::new(Arc::clone(&registry)));

    let first = {
        let bridge = Arc::clone(&bridge);
        std::thread::spawn(move || bridge.handle_signal())
    };
    std::thread::sleep(Duration::from_millis(5));
    let second = bridge.handle_signal();

    let first = first.join().unwrap();
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn test_signal_during_invocation_drain_waits_for_cleanup() {
    let registry = Arc::new(CleanupRegistry::new());
    let bridge = SignalBridge::new(Arc::clone(&registry));
    let released = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);

    let counter = Arc::clone(&released);
    let adapter = InvocationAdapter::new(
        move |inv: Invocation<Value, ()>, _: ()| {
            for i in 0..3 {
                let counter = Arc::clone(&counter);
                let started = (i == 0).then(|| started_tx.lock().unwrap().clone());
                inv.register_cleanup(CleanupHandler::sync(format!("conn-{i}"), move || {
                    if let Some(started) = started {
                        started.send(()).unwrap();
                    }
                    std::thread::sleep(Duration::from_millis(50));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
            async { Ok::<_, BoxError>(()) }
        },
        Arc::clone(&registry),
    );

    let invocation = std::thread::spawn(move || adapter.call(Value::Null, ()));
    started_rx.recv().unwrap();

    let report = bridge.handle_signal();

    // every handler finished once before the bridge would exit
    assert!(report.is_some());
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert!(invocation.join().unwrap().is_ok());
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert!(!registry.is_draining());
}

// ============================================================================
// Invocation adapter
// ============================================================================

#[test]
fn test_result_passes_through_and_registry_empties() {
    let registry = Arc::new(CleanupRegistry::new());
    let adapter = InvocationAdapter::new(
        |inv: Invocation<Value, ()>, _: ()| async move {
            inv.register_cleanup(CleanupHandler::sync("conn", || Ok(())));
            Ok::<_, BoxError>(json!({ "statusCode": 200, "echo": inv.event().clone() }))
        },
        Arc::clone(&registry),
    );

    let event = json!({ "id": 9, "tags": ["a", "b"] });
    let response = adapter.call(event.clone(), ()).unwrap();

    assert_eq!(response["echo"], event);
    assert!(registry.is_empty());
}

#[test]
fn test_error_propagates_after_cleanup() {
    let registry = Arc::new(CleanupRegistry::new());
    let drained_before_return = Arc::new(Mutex::new(None));
    let observed_registry = Arc::clone(&registry);

    let adapter = InvocationAdapter::new(
        |inv: Invocation<Value, ()>, _: ()| async move {
            inv.register_cleanup(CleanupHandler::sync("conn", || Ok(())));
            Err::<Value, BoxError>("upstream timed out".into())
        },
        Arc::clone(&registry),
    );

    let result = adapter.call(Value::Null, ());
    *drained_before_return.lock().unwrap() = Some(observed_registry.is_empty());

    assert_eq!(result.unwrap_err().to_string(), "upstream timed out");
    assert_eq!(*drained_before_return.lock().unwrap(), Some(true));
}

#[test]
fn test_process_reuse_across_invocations() {
    let registry = Arc::new(CleanupRegistry::new());
    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let adapter = InvocationAdapter::new(
        move |inv: Invocation<Value, ()>, _: ()| {
            let counter = Arc::clone(&counter);
            async move {
                inv.register_cleanup(CleanupHandler::sync("per-call", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
                Ok::<_, BoxError>(())
            }
        },
        Arc::clone(&registry),
    );

    for expected in 1..=3 {
        adapter.call(Value::Null, ()).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), expected);
        assert!(registry.is_empty());
    }
}
