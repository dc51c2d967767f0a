//! Deadlines, circuit breaking and run tracking of the timeout manager.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strata_core::{ExecutionState, Metrics, TimeoutConfig, UserExecutionContext};
use strata_execution::{BreakerStatus, ExecutionError, ExecutionTimeoutManager};

fn timeout_manager(config: TimeoutConfig) -> ExecutionTimeoutManager {
    ExecutionTimeoutManager::new(config, Metrics::new()).unwrap()
}

fn fast_config() -> TimeoutConfig {
    TimeoutConfig {
        default_timeout_seconds: 0.2,
        max_timeout_seconds: 5.0,
        cleanup_timeout_seconds: 0.2,
        ..TimeoutConfig::default()
    }
}

#[tokio::test]
async fn test_success_returns_value() {
    let manager = timeout_manager(fast_config());
    let value = manager
        .execute_with_timeout("echo", None, |_scope| async { Ok::<_, String>(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(manager.duration_history("echo").len(), 1);
}

#[tokio::test]
async fn test_breaker_opens_without_invoking_operation() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 3,
        circuit_breaker_recovery_timeout: 60.0,
        ..fast_config()
    });
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let result = manager
            .execute_with_timeout("flaky", None, move |_scope| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("upstream unavailable")
            })
            .await;
        assert!(matches!(result, Err(ExecutionError::Failed { .. })));
    }
    assert_eq!(manager.circuit_state("flaky").status, BreakerStatus::Open);

    let calls_clone = calls.clone();
    let result = manager
        .execute_with_timeout("flaky", None, move |_scope| async move {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;

    match result {
        Err(ExecutionError::CircuitOpen { agent_type, retry_after }) => {
            assert_eq!(agent_type, "flaky");
            assert!(retry_after > Duration::from_secs(50));
        }
        other => panic!("Expected CircuitOpen, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Other agent types are unaffected.
    assert!(manager
        .execute_with_timeout("steady", None, |_scope| async { Ok::<_, String>(()) })
        .await
        .is_ok());
}

#[tokio::test]
async fn test_half_open_trial_success_closes() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_recovery_timeout: 0.1,
        ..fast_config()
    });

    let _ = manager
        .execute_with_timeout("agent", None, |_scope| async { Err::<(), _>("boom") })
        .await;
    assert_eq!(manager.circuit_state("agent").status, BreakerStatus::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;
    manager
        .execute_with_timeout("agent", None, |_scope| async { Ok::<_, String>(()) })
        .await
        .unwrap();

    let state = manager.circuit_state("agent");
    assert_eq!(state.status, BreakerStatus::Closed);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test]
async fn test_half_open_trial_failure_reopens() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_recovery_timeout: 0.1,
        ..fast_config()
    });

    let _ = manager
        .execute_with_timeout("agent", None, |_scope| async { Err::<(), _>("boom") })
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let trial = manager
        .execute_with_timeout("agent", None, |_scope| async { Err::<(), _>("still down") })
        .await;
    assert!(matches!(trial, Err(ExecutionError::Failed { .. })));
    assert_eq!(manager.circuit_state("agent").status, BreakerStatus::Open);

    let rejected = manager
        .execute_with_timeout("agent", None, |_scope| async { Ok::<_, String>(()) })
        .await;
    assert!(matches!(rejected, Err(ExecutionError::CircuitOpen { .. })));
}

#[tokio::test]
async fn test_late_success_keeps_breaker_open() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_recovery_timeout: 60.0,
        default_timeout_seconds: 2.0,
        ..fast_config()
    });

    let slow = manager.execute_with_timeout("agent", None, |_scope| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, String>(())
    });
    let fast = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager
            .execute_with_timeout("agent", None, |_scope| async { Err::<(), _>("boom") })
            .await
    };
    let (slow, fast) = tokio::join!(slow, fast);
    assert!(slow.is_ok());
    assert!(matches!(fast, Err(ExecutionError::Failed { .. })));
    assert_eq!(manager.circuit_state("agent").status, BreakerStatus::Open);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let next = manager
        .execute_with_timeout("agent", None, move |_scope| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;
    assert!(matches!(next, Err(ExecutionError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_timeouts_open_breaker() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 2,
        circuit_breaker_recovery_timeout: 60.0,
        default_timeout_seconds: 0.05,
        ..fast_config()
    });
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let counter = calls.clone();
        let result = manager
            .execute_with_timeout("sluggish", None, move |_scope| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(ExecutionError::Timeout(_))));
    }
    assert_eq!(manager.circuit_state("sluggish").status, BreakerStatus::Open);

    let counter = calls.clone();
    let rejected = manager
        .execute_with_timeout("sluggish", None, move |_scope| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;
    assert!(matches!(rejected, Err(ExecutionError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropped_trial_frees_half_open() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_recovery_timeout: 0.05,
        default_timeout_seconds: 2.0,
        ..fast_config()
    });

    let _ = manager
        .execute_with_timeout("agent", None, |_scope| async { Err::<(), _>("boom") })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = cleaned.clone();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        manager.execute_with_timeout("agent", None, move |scope| async move {
            scope.on_cleanup(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        }),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cleaned.load(Ordering::SeqCst));

    manager
        .execute_with_timeout("agent", None, |_scope| async { Ok::<_, String>(()) })
        .await
        .unwrap();
    assert_eq!(manager.circuit_state("agent").status, BreakerStatus::Closed);
}

#[tokio::test]
async fn test_dropped_tracked_run_is_settled() {
    let manager = timeout_manager(TimeoutConfig {
        default_timeout_seconds: 2.0,
        ..fast_config()
    });
    let context = UserExecutionContext::new("user-1", "thread-1", "run-drop").unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        manager.execute_for_context(&context, "long", None, |_scope| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        }),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(manager.execution_state("run-drop"), Some(ExecutionState::Cancelled));
    assert!(manager.tracker().active_runs().is_empty());

    assert!(manager.release_execution("run-drop", "user-1"));
    manager
        .execute_for_context(&context, "long", None, |_scope| async { Ok::<_, String>(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_start_hook_runs_only_after_admission() {
    let manager = timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_recovery_timeout: 60.0,
        ..fast_config()
    });
    let context = UserExecutionContext::new("user-1", "thread-1", "run-1").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let started = events.clone();
    let ran = events.clone();
    manager
        .execute_for_context_with_start(
            &context,
            "agent",
            None,
            async move { started.lock().unwrap().push("started") },
            move |_scope| async move {
                ran.lock().unwrap().push("ran");
                Err::<(), _>("boom")
            },
        )
        .await
        .unwrap_err();
    assert_eq!(*events.lock().unwrap(), vec!["started", "ran"]);

    let retry = UserExecutionContext::new("user-1", "thread-1", "run-2").unwrap();
    let started = events.clone();
    let rejected = manager
        .execute_for_context_with_start(
            &retry,
            "agent",
            None,
            async move { started.lock().unwrap().push("started") },
            |_scope| async { Ok::<_, String>(()) },
        )
        .await;
    assert!(matches!(rejected, Err(ExecutionError::CircuitOpen { .. })));
    assert_eq!(events.lock().unwrap().len(), 2);
    assert!(manager.execution_state("run-2").is_none());
}

#[tokio::test]
async fn test_half_open_admits_one_concurrent_trial() {
    let manager = Arc::new(timeout_manager(TimeoutConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_recovery_timeout: 0.05,
        default_timeout_seconds: 2.0,
        ..fast_config()
    }));

    let _ = manager
        .execute_with_timeout("agent", None, |_scope| async { Err::<(), _>("boom") })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let trial_manager = manager.clone();
    let trial = tokio::spawn(async move {
        trial_manager
            .execute_with_timeout("agent", None, |_scope| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = manager
        .execute_with_timeout("agent", None, |_scope| async { Ok::<_, String>(()) })
        .await;
    assert!(matches!(second, Err(ExecutionError::CircuitOpen { .. })));

    trial.await.unwrap().unwrap();
    assert_eq!(manager.circuit_state("agent").status, BreakerStatus::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_holds_against_blocking_operation() {
    let manager = timeout_manager(TimeoutConfig {
        default_timeout_seconds: 2.0,
        max_timeout_seconds: 10.0,
        ..TimeoutConfig::default()
    });

    let started = Instant::now();
    let result = manager
        .execute_with_timeout("blocking", None, |_scope| async {
            std::thread::sleep(Duration::from_secs(3));
            Ok::<_, String>(())
        })
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(ExecutionError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(1800), "raised too early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(2500), "raised too late: {:?}", elapsed);
}

#[tokio::test]
async fn test_adaptive_timeout_grows_for_slow_agent() {
    let manager = timeout_manager(TimeoutConfig {
        default_timeout_seconds: 0.2,
        max_timeout_seconds: 5.0,
        timeout_adjustment_factor: 1.5,
        circuit_breaker_failure_threshold: 10,
        ..fast_config()
    });

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let result = manager
            .execute_with_timeout("slow", None, |_scope| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok::<_, String>(())
            })
            .await;
        outcomes.push(result.is_ok());
    }

    // 0.2s and 0.3s time out; 0.45s lets the 0.4s agent finish.
    assert_eq!(outcomes, vec![false, false, true]);
    assert!(manager.effective_timeout("slow") > Duration::from_millis(200));
    assert_eq!(manager.duration_history("slow").len(), 3);
}

#[tokio::test]
async fn test_adaptive_disabled_keeps_default() {
    let manager = timeout_manager(TimeoutConfig {
        adaptive_timeout_enabled: false,
        ..fast_config()
    });

    let _ = manager
        .execute_with_timeout("slow", None, |_scope| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(())
        })
        .await;
    assert_eq!(manager.effective_timeout("slow"), Duration::from_millis(200));
}

#[tokio::test]
async fn test_explicit_timeout_capped_at_max() {
    let manager = timeout_manager(TimeoutConfig {
        default_timeout_seconds: 0.1,
        max_timeout_seconds: 0.2,
        ..fast_config()
    });

    let started = Instant::now();
    let result = manager
        .execute_with_timeout("capped", Some(Duration::from_secs(30)), |_scope| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    match result {
        Err(ExecutionError::Timeout(failure)) => {
            assert_eq!(failure.timeout, Duration::from_millis(200));
        }
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_partial_results_attached_on_timeout() {
    let manager = timeout_manager(fast_config());

    let result = manager
        .execute_with_timeout("researcher", None, |scope| async move {
            scope.push_partial(json!({"sources": 3}));
            scope.push_partial(json!({"draft": "intro"}));
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(
        err.partial_results(),
        &[json!({"sources": 3}), json!({"draft": "intro"})]
    );
}

#[tokio::test]
async fn test_partial_results_dropped_when_disabled() {
    let manager = timeout_manager(TimeoutConfig {
        allow_partial_results: false,
        ..fast_config()
    });

    let result = manager
        .execute_with_timeout("researcher", None, |scope| async move {
            scope.push_partial(json!({"sources": 3}));
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    match result {
        Err(ExecutionError::Timeout(failure)) => assert!(failure.partial_results.is_empty()),
        other => panic!("Expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cleanup_failure_does_not_mask_timeout() {
    let metrics = Metrics::new();
    let manager = ExecutionTimeoutManager::new(fast_config(), metrics.clone()).unwrap();

    let result = manager
        .execute_with_timeout("leaky", None, |scope| async move {
            scope.on_cleanup(|| async { Err("connection already reset".to_string()) });
            scope.on_cleanup(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            });
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    match result {
        Err(ExecutionError::Timeout(failure)) => {
            let cleanup = failure.cleanup_error.expect("cleanup failure recorded");
            assert!(cleanup.contains("connection already reset"));
            assert!(cleanup.contains("cleanup exceeded"));
        }
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert_eq!(metrics.snapshot().cleanup_failures, 1);
    assert_eq!(metrics.snapshot().executions_timed_out, 1);
}

#[tokio::test]
async fn test_cleanup_runs_on_timeout() {
    let manager = timeout_manager(fast_config());
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();

    let result = manager
        .execute_with_timeout("holder", None, move |scope| async move {
            scope.on_cleanup(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    match result {
        Err(ExecutionError::Timeout(failure)) => assert!(failure.cleanup_error.is_none()),
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_nested_operations_are_cancelled() {
    let manager = timeout_manager(fast_config());
    let nested_cancelled = Arc::new(AtomicBool::new(false));
    let flag = nested_cancelled.clone();

    let result = manager
        .execute_with_timeout("parent", None, move |scope| async move {
            let child = scope.child_token();
            tokio::spawn(async move {
                child.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    assert!(matches!(result, Err(ExecutionError::Timeout(_))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(nested_cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_panic_is_isolated() {
    let manager = timeout_manager(fast_config());
    let context = UserExecutionContext::new("user-1", "thread-1", "run-panic").unwrap();

    let result = manager
        .execute_for_context(&context, "buggy", None, |_scope| async {
            if true {
                panic!("agent bug");
            }
            Ok::<_, String>(())
        })
        .await;

    assert!(matches!(result, Err(ExecutionError::Panicked { .. })));
    assert_eq!(manager.execution_state("run-panic"), Some(ExecutionState::Failed));
}

#[tokio::test]
async fn test_context_run_lifecycle() {
    let manager = timeout_manager(fast_config());
    let context = UserExecutionContext::new("user-1", "thread-1", "run-1").unwrap();

    manager
        .execute_for_context(&context, "echo", None, |_scope| async { Ok::<_, String>("done") })
        .await
        .unwrap();
    assert_eq!(manager.execution_state("run-1"), Some(ExecutionState::Completed));

    let result = manager
        .execute_for_context(&context, "echo", None, |_scope| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>("late")
        })
        .await;
    assert!(matches!(result, Err(ExecutionError::Timeout(_))));
    assert_eq!(manager.execution_state("run-1"), Some(ExecutionState::Timeout));

    let record = manager.execution_record("run-1").unwrap();
    assert_eq!(record.user_id, "user-1");
    assert!(manager.release_execution("run-1", "user-1"));
    assert!(manager.execution_state("run-1").is_none());
}

#[tokio::test]
async fn test_cancel_execution() {
    let manager = Arc::new(timeout_manager(TimeoutConfig {
        default_timeout_seconds: 5.0,
        ..fast_config()
    }));
    let context = UserExecutionContext::new("user-1", "thread-1", "run-cancel").unwrap();

    let running = manager.clone();
    let task = tokio::spawn(async move {
        running
            .execute_for_context(&context, "long", None, |_scope| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, String>(())
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.execution_state("run-cancel"), Some(ExecutionState::Running));

    let duplicate = UserExecutionContext::new("user-1", "thread-1", "run-cancel").unwrap();
    let again = manager
        .execute_for_context(&duplicate, "long", None, |_scope| async { Ok::<_, String>(()) })
        .await;
    assert!(matches!(again, Err(ExecutionError::AlreadyRunning(_))));

    assert!(manager.cancel_execution("run-cancel", "user-1").unwrap());
    let result = task.await.unwrap();
    assert!(matches!(result, Err(ExecutionError::Cancelled { .. })));
    assert_eq!(manager.execution_state("run-cancel"), Some(ExecutionState::Cancelled));
    assert_eq!(manager.circuit_state("long").failure_count, 0);
}

#[tokio::test]
async fn test_force_kill_marks_dead() {
    let manager = Arc::new(timeout_manager(TimeoutConfig {
        default_timeout_seconds: 5.0,
        ..fast_config()
    }));
    let context = UserExecutionContext::new("user-1", "thread-1", "run-kill").unwrap();

    let running = manager.clone();
    let task = tokio::spawn(async move {
        running
            .execute_for_context(&context, "stuck", None, |_scope| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, String>(())
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.force_kill("run-kill", "user-1").unwrap(), ExecutionState::Dead);

    let result = task.await.unwrap();
    assert!(matches!(result, Err(ExecutionError::Cancelled { .. })));
    assert_eq!(manager.execution_state("run-kill"), Some(ExecutionState::Dead));
}

#[tokio::test]
async fn test_other_users_cannot_control_run() {
    let manager = Arc::new(timeout_manager(TimeoutConfig {
        default_timeout_seconds: 5.0,
        ..fast_config()
    }));
    let context = UserExecutionContext::new("user-1", "thread-1", "run-owned").unwrap();

    let running = manager.clone();
    let task = tokio::spawn(async move {
        running
            .execute_for_context(&context, "long", None, |_scope| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, String>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        manager.cancel_execution("run-owned", "user-2"),
        Err(ExecutionError::NotOwner { .. })
    ));
    assert!(matches!(
        manager.force_kill("run-owned", "user-2"),
        Err(ExecutionError::NotOwner { .. })
    ));
    assert_eq!(manager.execution_state("run-owned"), Some(ExecutionState::Running));

    assert!(manager.cancel_execution("run-owned", "user-1").unwrap());
    assert!(matches!(
        task.await.unwrap(),
        Err(ExecutionError::Cancelled { .. })
    ));
    assert!(!manager.release_execution("run-owned", "user-2"));
    assert!(manager.release_execution("run-owned", "user-1"));
}

#[test]
fn test_invalid_config_rejected() {
    for factor in [f64::NAN, f64::INFINITY, 0.5] {
        let config = TimeoutConfig {
            timeout_adjustment_factor: factor,
            ..fast_config()
        };
        assert!(ExecutionTimeoutManager::new(config, Metrics::new()).is_err());
    }
    let config = TimeoutConfig {
        default_timeout_seconds: f64::NAN,
        ..fast_config()
    };
    assert!(ExecutionTimeoutManager::new(config, Metrics::new()).is_err());
}
