//! Concurrent claims: no task is ever handed to two workers.

use std::collections::HashSet;
use std::sync::Arc;

use taskq::clock::SystemClock;
use taskq::db::MemoryStore;
use taskq::engine::QueueController;
use taskq::ids::RandomUuidFactory;
use taskq::model::{ActivityQuery, ActivityStatus, TaskId, TaskSubmit};
use taskq::status::StatusCounters;

fn controller() -> (QueueController<MemoryStore>, Arc<StatusCounters>) {
    let counters = Arc::new(StatusCounters::new());
    let controller = QueueController::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(RandomUuidFactory),
        counters.clone(),
    );
    (controller, counters)
}

/// Each worker peeks `attempts` times; returns every claimed id.
async fn race(
    controller: &QueueController<MemoryStore>,
    workers: usize,
    attempts: usize,
) -> Vec<TaskId> {
    let handles: Vec<_> = (0..workers)
        .map(|n| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let worker_id = format!("worker-{n}");
                let mut claimed = Vec::new();
                for _ in 0..attempts {
                    if let Some(task) = controller.peek(&worker_id).await.unwrap() {
                        assert_eq!(task.worker_id.as_deref(), Some(worker_id.as_str()));
                        claimed.push(task.id);
                    }
                    tokio::task::yield_now().await;
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_peeks_never_share_a_task() {
    let (controller, counters) = controller();
    for _ in 0..50 {
        controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    }

    let claimed = race(&controller, 8, 10).await;

    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(unique.len(), claimed.len(), "a task was claimed twice");
    assert_eq!(claimed.len(), 50);
    assert_eq!(counters.in_progress_count(), 50);
    assert_eq!(counters.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claims_are_bounded_by_attempts() {
    let (controller, _) = controller();
    for _ in 0..100 {
        controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    }

    // 4 workers x 5 attempts can claim at most 20 of 100.
    let claimed = race(&controller, 4, 5).await;
    assert_eq!(claimed.len(), 20);

    let counts = controller.counts().await.unwrap();
    assert_eq!(counts.pending, 80);
    assert_eq!(counts.in_progress, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_removes_archive_each_task_once() {
    let (controller, counters) = controller();
    for _ in 0..20 {
        controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    }

    let mut claimed = Vec::new();
    while let Some(task) = controller.peek("worker-1").await.unwrap() {
        claimed.push(task);
    }
    assert_eq!(claimed.len(), 20);

    // Two reporters race to retire every task.
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let controller = controller.clone();
            let tasks = claimed.clone();
            tokio::spawn(async move {
                let mut won = 0;
                for task in &tasks {
                    if controller
                        .remove(task, ActivityStatus::Success, None, None)
                        .await
                        .is_ok()
                    {
                        won += 1;
                    }
                }
                won
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 20);
    assert_eq!(counters.success_count(), 20);

    let archived = controller
        .activities(&ActivityQuery::default())
        .await
        .unwrap();
    assert_eq!(archived.len(), 20);
}
