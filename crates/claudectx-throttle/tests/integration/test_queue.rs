//! Integration tests for RequestQueueManager scheduling
//!
//! Runs under a paused clock so sleeps inside work items advance time
//! deterministically.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use claudectx_throttle::{RequestPriority, RequestQueueManager, ThrottleError, DEFAULT_QUEUE};
use tokio::time::Instant;

use crate::common::{self, ConcurrencyProbe, DispatchLog};

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_cap() {
    let manager = RequestQueueManager::new(2).unwrap();
    let probe = ConcurrencyProbe::default();
    manager.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..6u32 {
        let probe = probe.clone();
        let handle = manager
            .enqueue(
                move || async move {
                    probe.enter();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    probe.exit();
                    Ok(i)
                },
                RequestPriority::Normal,
                DEFAULT_QUEUE,
            )
            .unwrap();
        handles.push(handle);
    }

    common::settle().await;
    let metrics = manager.metrics(DEFAULT_QUEUE);
    assert_eq!(metrics.in_flight, 2);
    assert_eq!(metrics.backlog, 4);

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i as u32);
    }
    assert_eq!(probe.peak(), 2);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_slots_run_in_parallel() {
    let manager = RequestQueueManager::new(2).unwrap();
    manager.start().unwrap();
    let start = Instant::now();

    let first = manager
        .enqueue(
            || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok("first")
            },
            RequestPriority::Normal,
            DEFAULT_QUEUE,
        )
        .unwrap();
    let second = manager
        .enqueue(
            || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok("second")
            },
            RequestPriority::Normal,
            DEFAULT_QUEUE,
        )
        .unwrap();

    assert_eq!(first.await.unwrap(), "first");
    assert_eq!(second.await.unwrap(), "second");

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1100), "ran serially: {elapsed:?}");

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fifo_within_a_tier() {
    let manager = RequestQueueManager::new(1).unwrap();
    let log = DispatchLog::default();

    let mut handles = Vec::new();
    for i in 0..5 {
        let log = log.clone();
        handles.push(
            manager
                .enqueue(
                    move || async move {
                        log.record(format!("item-{i}"));
                        Ok(())
                    },
                    RequestPriority::Normal,
                    DEFAULT_QUEUE,
                )
                .unwrap(),
        );
    }

    manager.start().unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        log.order(),
        vec!["item-0", "item-1", "item-2", "item-3", "item-4"]
    );
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_priority_order_with_one_slot() {
    let manager = RequestQueueManager::new(1).unwrap();
    let log = DispatchLog::default();

    let mut handles = Vec::new();
    for priority in RequestPriority::ALL {
        let log = log.clone();
        handles.push(
            manager
                .enqueue(
                    move || async move {
                        log.record(priority.to_string());
                        Ok(())
                    },
                    priority,
                    DEFAULT_QUEUE,
                )
                .unwrap(),
        );
    }

    manager.start().unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(log.order(), vec!["critical", "high", "normal", "low"]);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_critical_overtakes_pending_low() {
    let manager = RequestQueueManager::new(1).unwrap();
    let log = DispatchLog::default();
    manager.start().unwrap();

    let blocker_log = log.clone();
    let blocker = manager
        .enqueue(
            move || async move {
                blocker_log.record("blocker");
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            RequestPriority::Normal,
            DEFAULT_QUEUE,
        )
        .unwrap();
    common::settle().await;

    let low_log = log.clone();
    let low = manager
        .enqueue(
            move || async move {
                low_log.record("low");
                Ok(())
            },
            RequestPriority::Low,
            DEFAULT_QUEUE,
        )
        .unwrap();
    let critical_log = log.clone();
    let critical = manager
        .enqueue(
            move || async move {
                critical_log.record("critical");
                Ok(())
            },
            RequestPriority::Critical,
            DEFAULT_QUEUE,
        )
        .unwrap();

    blocker.await.unwrap();
    critical.await.unwrap();
    low.await.unwrap();

    assert_eq!(log.order(), vec!["blocker", "critical", "low"]);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_in_flight_and_cancels_backlog() {
    let manager = RequestQueueManager::new(3).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    manager.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..5u32 {
        let ran = Arc::clone(&ran);
        handles.push(
            manager
                .enqueue(
                    move || async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(i)
                    },
                    RequestPriority::Normal,
                    DEFAULT_QUEUE,
                )
                .unwrap(),
        );
    }

    common::settle().await;
    assert_eq!(manager.metrics(DEFAULT_QUEUE).in_flight, 3);

    manager.stop().await;

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await);
    }

    for (i, result) in results[..3].iter().enumerate() {
        assert_eq!(*result.as_ref().unwrap(), i as u32);
    }
    for result in &results[3..] {
        assert!(matches!(result, Err(ThrottleError::Cancelled)));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);

    let metrics = manager.metrics(DEFAULT_QUEUE);
    assert_eq!(metrics.completed, 3);
    assert_eq!(metrics.cancelled, 2);
    assert_eq!(metrics.in_flight, 0);
    assert_eq!(metrics.backlog, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_and_panics_are_isolated() {
    let manager = RequestQueueManager::new(1).unwrap();
    manager.start().unwrap();

    let failing = manager
        .enqueue(
            || async { Err::<u32, _>(anyhow::anyhow!("export endpoint returned 500")) },
            RequestPriority::High,
            DEFAULT_QUEUE,
        )
        .unwrap();
    let panicking = manager
        .enqueue(
            || async {
                if true {
                    panic!("malformed conversation payload");
                }
                Ok(0u32)
            },
            RequestPriority::High,
            DEFAULT_QUEUE,
        )
        .unwrap();
    let healthy = manager
        .enqueue(|| async { Ok(3u32) }, RequestPriority::Normal, DEFAULT_QUEUE)
        .unwrap();

    assert!(matches!(failing.await, Err(ThrottleError::WorkFailed(_))));
    match panicking.await {
        Err(ThrottleError::WorkPanicked(message)) => {
            assert!(message.contains("malformed conversation payload"))
        }
        other => panic!("expected WorkPanicked, got {other:?}"),
    }
    assert_eq!(healthy.await.unwrap(), 3);

    let metrics = manager.metrics(DEFAULT_QUEUE);
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.completed, 1);
    assert!(manager.is_running());

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_queues_have_independent_caps() {
    let manager = RequestQueueManager::new(1).unwrap();
    manager.configure_queue("export", 2).unwrap();
    let sync_probe = ConcurrencyProbe::default();
    let export_probe = ConcurrencyProbe::default();
    manager.start().unwrap();

    let mut handles = Vec::new();
    for (queue, probe) in [("sync", &sync_probe), ("export", &export_probe)] {
        for _ in 0..4 {
            let probe = probe.clone();
            handles.push(
                manager
                    .enqueue(
                        move || async move {
                            probe.enter();
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            probe.exit();
                            Ok(())
                        },
                        RequestPriority::Normal,
                        queue,
                    )
                    .unwrap(),
            );
        }
    }

    common::settle().await;
    assert_eq!(manager.metrics("sync").in_flight, 1);
    assert_eq!(manager.metrics("export").in_flight, 2);

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(sync_probe.peak(), 1);
    assert_eq!(export_probe.peak(), 2);

    let all = manager.get_all_metrics();
    assert_eq!(all.len(), 2);
    assert_eq!(all["sync"].completed, 4);
    assert_eq!(all["export"].completed, 4);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_only_affects_queued_entries() {
    let manager = RequestQueueManager::new(1).unwrap();
    manager.start().unwrap();

    let running = manager
        .enqueue(
            || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("ran")
            },
            RequestPriority::Normal,
            DEFAULT_QUEUE,
        )
        .unwrap();
    let queued = manager
        .enqueue(|| async { Ok("never") }, RequestPriority::Normal, DEFAULT_QUEUE)
        .unwrap();
    common::settle().await;

    assert!(!running.cancel());
    assert!(queued.cancel());

    assert_eq!(running.await.unwrap(), "ran");
    assert!(matches!(queued.await, Err(ThrottleError::Cancelled)));

    let metrics = manager.metrics(DEFAULT_QUEUE);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.cancelled, 1);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_latency_and_wait_metrics() {
    let manager = RequestQueueManager::new(1).unwrap();
    manager.start().unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        handles.push(
            manager
                .enqueue(
                    || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    },
                    RequestPriority::Normal,
                    DEFAULT_QUEUE,
                )
                .unwrap(),
        );
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let metrics = manager.metrics(DEFAULT_QUEUE);
    assert_eq!(metrics.total_enqueued, 2);
    // Second item waited for the first one's 100ms
    assert!(metrics.avg_wait_ms >= 49.0, "avg wait {}", metrics.avg_wait_ms);
    // Latencies are ~100ms and ~200ms
    assert!(metrics.avg_latency_ms >= 149.0, "avg latency {}", metrics.avg_latency_ms);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_work_enqueued_from_within_work() {
    let manager = Arc::new(RequestQueueManager::new(2).unwrap());
    manager.start().unwrap();

    let inner_manager = Arc::clone(&manager);
    let outer = manager
        .enqueue(
            move || async move {
                let child = inner_manager.enqueue(
                    || async { Ok(20u32) },
                    RequestPriority::High,
                    DEFAULT_QUEUE,
                )?;
                Ok::<_, anyhow::Error>(child.await? + 1)
            },
            RequestPriority::Normal,
            DEFAULT_QUEUE,
        )
        .unwrap();

    assert_eq!(outer.await.unwrap(), 21);
    manager.stop().await;
}
