//! Integration tests for admission, the worker pool and settlement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatch_rs::db::{DeadLetterFilter, Db};
use dispatch_rs::engine::{Admission, DispatchConfig, Dispatcher, WorkerPool, executor_fn};
use dispatch_rs::event::{Event, EventKind};
use dispatch_rs::model::*;
use serde_json::json;
use tokio::sync::broadcast;

async fn test_dispatcher(config: DispatchConfig) -> Dispatcher {
    let db = Db::in_memory().await.expect("failed to create in-memory db");
    Dispatcher::new(Arc::new(db), config)
}

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        retry_backoff: Duration::ZERO,
        ..Default::default()
    }
}

fn is_terminal(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::WorkSucceeded { .. } | EventKind::WorkDead { .. } | EventKind::WorkCancelled { .. }
    )
}

/// Collect events until `n` items reached a terminal state.
async fn wait_terminal(rx: &mut broadcast::Receiver<Event>, n: usize) -> Vec<EventKind> {
    let collect = async {
        let mut seen = Vec::new();
        let mut terminal = 0;
        while terminal < n {
            match rx.recv().await {
                Ok(event) => {
                    if is_terminal(&event.kind) {
                        terminal += 1;
                    }
                    seen.push(event.kind);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
        seen
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("timed out waiting for work to settle")
}

fn msg(subject: &str, text: &str) -> NewWorkItem {
    NewWorkItem::inbound(subject).payload(json!({ "text": text }))
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fails_twice_then_succeeds_on_third_attempt() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    let executor = {
        let calls = Arc::clone(&calls);
        executor_fn(move |_item| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    ExecOutcome::transient("backend unavailable")
                } else {
                    ExecOutcome::success()
                }
            }
        })
    };
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 2);

    let id = match dispatcher.submit(msg("chat-1", "hello").max_attempts(3)) {
        Admission::Accepted(id) => id,
        other => panic!("expected Accepted, got {other:?}"),
    };

    let seen = wait_terminal(&mut events, 1).await;
    let retries = seen
        .iter()
        .filter(|k| matches!(k, EventKind::WorkRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
    match seen.last().unwrap() {
        EventKind::WorkSucceeded { id: done, attempts, .. } => {
            assert_eq!(*done, id);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        dispatcher.db().count_dead_letters().await.unwrap(),
        0,
        "succeeded work must not be dead-lettered"
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_letters() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let executor = executor_fn(|_item| async { ExecOutcome::transient("always broken") });
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 1);

    dispatcher.submit(msg("chat-1", "doomed").max_attempts(2));
    let seen = wait_terminal(&mut events, 1).await;
    assert!(matches!(
        seen.last().unwrap(),
        EventKind::WorkDead { attempts: 2, .. }
    ));

    let letters = dispatcher
        .dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].item.attempts, 2);
    assert_eq!(letters[0].item.state, State::Dead);
    assert_eq!(letters[0].last_error, "always broken");

    pool.shutdown().await;
}

#[tokio::test]
async fn requeued_dead_letter_runs_again_with_fresh_attempts() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let healthy = Arc::new(AtomicBool::new(false));

    let executor = {
        let healthy = Arc::clone(&healthy);
        executor_fn(move |_item| {
            let ok = healthy.load(Ordering::SeqCst);
            async move {
                if ok {
                    ExecOutcome::success()
                } else {
                    ExecOutcome::transient("down")
                }
            }
        })
    };
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 1);

    let Admission::Accepted(id) = dispatcher.submit(msg("chat-1", "retry me").max_attempts(1))
    else {
        panic!("expected Accepted");
    };
    wait_terminal(&mut events, 1).await;
    assert_eq!(dispatcher.db().count_dead_letters().await.unwrap(), 1);

    healthy.store(true, Ordering::SeqCst);
    assert_eq!(
        dispatcher.requeue_dead(id).await.unwrap(),
        Admission::Accepted(id)
    );
    let seen = wait_terminal(&mut events, 1).await;
    assert!(matches!(
        seen.last().unwrap(),
        EventKind::WorkSucceeded { attempts: 1, .. }
    ));
    assert_eq!(dispatcher.db().count_dead_letters().await.unwrap(), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn requeue_refused_while_fingerprint_is_live() {
    let mut config = fast_config();
    config.dedup_window = Duration::ZERO;
    let dispatcher = test_dispatcher(config).await;
    let item = NewWorkItem::inbound("chat-1")
        .dedup_key("chat-1:again")
        .max_attempts(1);

    assert!(dispatcher.submit(item.clone()).is_accepted());
    let claimed = dispatcher.queue().dequeue().await.unwrap();
    let dead_id = claimed.id;
    dispatcher
        .report(claimed, ExecOutcome::terminal("bad"))
        .await
        .unwrap();

    // A twin with the same fingerprint is pending; no workers are running.
    assert!(dispatcher.submit(item).is_accepted());
    assert!(dispatcher.queue().is_live("chat-1:again"));

    assert_eq!(
        dispatcher.requeue_dead(dead_id).await.unwrap(),
        Admission::Duplicate
    );
    assert_eq!(dispatcher.db().count_dead_letters().await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_message_executes_once() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    let executor = {
        let calls = Arc::clone(&calls);
        executor_fn(move |_item| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { ExecOutcome::success() }
        })
    };
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 2);

    assert!(dispatcher.submit(msg("chat-1", "same")).is_accepted());
    assert_eq!(dispatcher.submit(msg("chat-1", "same")), Admission::Duplicate);
    wait_terminal(&mut events, 1).await;

    // Still inside the window after completion.
    assert_eq!(dispatcher.submit(msg("chat-1", "same")), Admission::Duplicate);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn burst_beyond_bucket_capacity_is_rate_limited() {
    let mut config = fast_config();
    config.rate_limit.capacity = 3.0;
    config.rate_limit.refill_per_sec = 0.001;
    let dispatcher = test_dispatcher(config).await;

    let results: Vec<Admission> = (0..5)
        .map(|i| dispatcher.submit(msg("chat-1", &format!("m{i}"))))
        .collect();
    let accepted = results.iter().filter(|a| a.is_accepted()).count();
    let limited = results
        .iter()
        .filter(|a| **a == Admission::RateLimited)
        .count();
    assert_eq!(accepted, 3);
    assert_eq!(limited, 2);

    // Other identities have their own bucket.
    assert!(dispatcher.submit(msg("chat-2", "m0")).is_accepted());
}

#[tokio::test]
async fn higher_priority_drains_first() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let order = Arc::new(Mutex::new(Vec::new()));

    dispatcher.submit(msg("a", "a").priority(Priority::High));
    dispatcher.submit(msg("b", "b").priority(Priority::Low));
    dispatcher.submit(msg("c", "c").priority(Priority::High));

    let executor = {
        let order = Arc::clone(&order);
        executor_fn(move |item: WorkItem| {
            order.lock().unwrap().push(item.subject.clone());
            async { ExecOutcome::success() }
        })
    };
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 1);
    wait_terminal(&mut events, 3).await;

    assert_eq!(*order.lock().unwrap(), vec!["a", "c", "b"]);
    pool.shutdown().await;
}

// ---------------------------------------------------------------------------
// Concurrency gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_executions_never_exceed_pool_size() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let executor = {
        let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
        executor_fn(move |_item| {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                ExecOutcome::success()
            }
        })
    };
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 3);

    for i in 0..12 {
        dispatcher.submit_system(msg(&format!("chat-{i}"), "work"));
    }
    wait_terminal(&mut events, 12).await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2, "pool should run work in parallel");
    assert_eq!(dispatcher.stats().in_flight, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn hung_execution_times_out_and_frees_its_slot() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let executor = executor_fn(|item: WorkItem| async move {
        if item.subject == "hang" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        ExecOutcome::success()
    });
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 1);

    dispatcher.submit(
        msg("hang", "forever")
            .timeout(Duration::from_millis(100))
            .max_attempts(1),
    );
    dispatcher.submit(msg("quick", "fine"));

    let seen = wait_terminal(&mut events, 2).await;
    let reasons: Vec<&str> = seen
        .iter()
        .filter_map(|k| match k {
            EventKind::WorkDead { reason, .. } => Some(reason.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("timed out"));
    assert!(seen.iter().any(|k| matches!(k, EventKind::WorkSucceeded { .. })));

    pool.shutdown().await;
}

#[tokio::test]
async fn panicking_execution_does_not_kill_the_pool() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let executor = executor_fn(|item: WorkItem| async move {
        if item.subject == "boom" {
            panic!("executor exploded");
        }
        ExecOutcome::success()
    });
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 1);

    dispatcher.submit(msg("boom", "x").max_attempts(2));
    let first = wait_terminal(&mut events, 1).await;
    match first.last().unwrap() {
        EventKind::WorkDead { attempts, reason, .. } => {
            assert_eq!(*attempts, 2);
            assert!(reason.contains("executor exploded"));
        }
        other => panic!("expected dead, got {other:?}"),
    }

    dispatcher.submit(msg("after", "y"));
    let second = wait_terminal(&mut events, 1).await;
    assert!(matches!(
        second.last().unwrap(),
        EventKind::WorkSucceeded { .. }
    ));
    pool.shutdown().await;
}

// ---------------------------------------------------------------------------
// Cancellation and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_subject_aborts_in_flight_and_drops_pending() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    let started = Arc::new(tokio::sync::Notify::new());
    let executor = {
        let started = Arc::clone(&started);
        executor_fn(move |_item| {
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ExecOutcome::success()
            }
        })
    };
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 1);

    dispatcher.submit(msg("chat-1", "first"));
    dispatcher.submit(msg("chat-1", "second"));
    started.notified().await;

    assert_eq!(dispatcher.cancel_subject("chat-1"), 2);
    let seen = wait_terminal(&mut events, 2).await;
    let cancelled = seen
        .iter()
        .filter(|k| matches!(k, EventKind::WorkCancelled { .. }))
        .count();
    assert_eq!(cancelled, 2);
    assert_eq!(dispatcher.db().count_dead_letters().await.unwrap(), 0);

    let stats = dispatcher.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.in_flight, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_claiming_and_refuses_new_work() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let executor = executor_fn(|_item| async { ExecOutcome::success() });
    let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 2);

    tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
        .await
        .expect("idle workers should stop promptly");
    assert!(dispatcher.is_closed());
    assert_eq!(dispatcher.submit(msg("chat-1", "late")), Admission::Closed);
}

#[tokio::test]
async fn events_carry_monotonic_sequence_numbers() {
    let dispatcher = test_dispatcher(fast_config()).await;
    let mut events = dispatcher.subscribe();
    dispatcher.submit(msg("chat-1", "a"));
    dispatcher.submit(msg("chat-1", "a"));
    dispatcher.submit(msg("chat-2", "b"));

    let mut kinds: HashMap<&'static str, usize> = HashMap::new();
    let mut last_seq = 0;
    for _ in 0..3 {
        let event = events.recv().await.unwrap();
        assert!(event.seq > last_seq);
        last_seq = event.seq;
        let name = match event.kind {
            EventKind::WorkAdmitted { .. } => "admitted",
            EventKind::WorkDeduplicated { .. } => "deduplicated",
            _ => "other",
        };
        *kinds.entry(name).or_default() += 1;
    }
    assert_eq!(kinds.get("admitted"), Some(&2));
    assert_eq!(kinds.get("deduplicated"), Some(&1));
}
