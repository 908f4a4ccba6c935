//! Integration tests for the worker loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use taskq::clock::ManualClock;
use taskq::db::MemoryStore;
use taskq::engine::{ProcessorRegistry, QueueController, TaskProcessor, Worker, WorkerConfig};
use taskq::ids::RandomUuidFactory;
use taskq::model::*;
use taskq::status::StatusCounters;
use tokio::sync::Notify;

fn controller() -> (QueueController<MemoryStore>, Arc<StatusCounters>) {
    let counters = Arc::new(StatusCounters::new());
    let controller = QueueController::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(1_000)),
        Arc::new(RandomUuidFactory),
        counters.clone(),
    );
    (controller, counters)
}

fn worker(
    controller: &QueueController<MemoryStore>,
    registry: ProcessorRegistry,
) -> Worker<MemoryStore> {
    polling_worker(controller, registry, Duration::from_millis(10))
}

fn polling_worker(
    controller: &QueueController<MemoryStore>,
    registry: ProcessorRegistry,
    poll_interval: Duration,
) -> Worker<MemoryStore> {
    Worker::new(
        controller.clone(),
        Arc::new(registry),
        WorkerConfig::new("worker-1").poll_interval(poll_interval),
    )
}

/// Succeeds with an analysis reference and counts its calls.
#[derive(Default)]
struct Analyze {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskProcessor for Analyze {
    async fn process(&self, task: &Task) -> anyhow::Result<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TaskResult::with_analysis(format!("analysis-{}", task.id)))
    }
}

struct AlwaysFails;

#[async_trait]
impl TaskProcessor for AlwaysFails {
    async fn process(&self, _task: &Task) -> anyhow::Result<TaskResult> {
        anyhow::bail!("scanner crashed")
    }
}

/// Signals when it starts, then waits to be released.
struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl TaskProcessor for Gate {
    async fn process(&self, _task: &Task) -> anyhow::Result<TaskResult> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(TaskResult::default())
    }
}

#[tokio::test]
async fn run_once_reports_success() {
    let (controller, counters) = controller();
    let task = controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = worker(
        &controller,
        ProcessorRegistry::empty().register("REPORT", Analyze { calls: calls.clone() }),
    );

    assert!(worker.run_once().await.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let activity = controller.activity(task.id).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Success);
    assert_eq!(activity.worker_id.as_deref(), Some("worker-1"));
    assert_eq!(activity.analysis_id, Some(format!("analysis-{}", task.id)));
    assert_eq!(counters.success_count(), 1);
}

#[tokio::test]
async fn run_once_reports_failure_with_error() {
    let (controller, counters) = controller();
    let task = controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    let worker = worker(
        &controller,
        ProcessorRegistry::empty().register("REPORT", AlwaysFails),
    );

    assert!(worker.run_once().await.unwrap());

    let activity = controller.activity(task.id).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Failed);
    assert_eq!(activity.error_message.as_deref(), Some("scanner crashed"));
    assert!(activity.error_stacktrace.is_some());
    assert_eq!(counters.error_count(), 1);
}

#[tokio::test]
async fn unroutable_task_type_fails() {
    let (controller, _) = controller();
    let task = controller.submit(TaskSubmit::new("UNKNOWN")).await.unwrap();
    let worker = worker(&controller, ProcessorRegistry::empty());

    assert!(worker.run_once().await.unwrap());

    let activity = controller.activity(task.id).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Failed);
    assert!(activity.error_message.unwrap().contains("UNKNOWN"));
}

#[tokio::test]
async fn run_once_on_empty_queue_claims_nothing() {
    let (controller, _) = controller();
    let worker = worker(&controller, ProcessorRegistry::empty());
    assert!(!worker.run_once().await.unwrap());
}

#[tokio::test]
async fn paused_worker_claims_nothing() {
    let (controller, _) = controller();
    let task = controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    let worker = worker(&controller, ProcessorRegistry::empty());

    controller.pause_peek();
    assert!(!worker.run_once().await.unwrap());
    let stored = controller.task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
}

// Paused time: sleeps complete instantly in virtual time, so the asserted
// intervals are exact.
#[tokio::test(start_paused = true)]
async fn run_drains_queue_and_stops_on_shutdown() {
    let (controller, counters) = controller();
    for _ in 0..5 {
        controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    }
    let poll_interval = Duration::from_secs(60);
    let worker = polling_worker(
        &controller,
        ProcessorRegistry::empty().register("REPORT", Analyze::default()),
        poll_interval,
    );
    let start = tokio::time::Instant::now();

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while counters.success_count() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue was not drained");
    // Claims follow each other without waiting out the poll interval.
    assert!(start.elapsed() < poll_interval);

    // Shutdown interrupts the idle wait.
    worker.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();

    assert!(start.elapsed() < poll_interval);

    let counts = controller.counts().await.unwrap();
    assert_eq!(counts, QueueCounts::default());
}

#[tokio::test(start_paused = true)]
async fn idle_worker_waits_poll_interval_before_next_claim() {
    let (controller, counters) = controller();
    let poll_interval = Duration::from_secs(1);
    let worker = polling_worker(
        &controller,
        ProcessorRegistry::empty().register("REPORT", Analyze::default()),
        poll_interval,
    );
    let start = tokio::time::Instant::now();

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // The first poll finds nothing; work arriving meanwhile waits for the
    // next one.
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    while counters.success_count() < 1 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= poll_interval, "claimed after {elapsed:?}");
    assert!(elapsed < poll_interval + Duration::from_millis(100));

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cleared_task_outcome_is_discarded() {
    let (controller, counters) = controller();
    let task = controller.submit(TaskSubmit::new("REPORT")).await.unwrap();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let worker = worker(
        &controller,
        ProcessorRegistry::empty().register(
            "REPORT",
            Gate {
                started: started.clone(),
                release: release.clone(),
            },
        ),
    );

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run_once().await }
    });

    started.notified().await;
    assert_eq!(controller.clear().await.unwrap(), 1);
    release.notify_one();

    // The worker treats the rejected outcome as handled.
    assert!(handle.await.unwrap().unwrap());

    let activity = controller.activity(task.id).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Canceled);
    assert_eq!(counters.success_count(), 0);
    assert_eq!(counters.canceled_count(), 1);
}
