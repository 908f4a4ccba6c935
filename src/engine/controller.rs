//! Queue controller: the lifecycle API over a [`QueueStore`].
//!
//! The store guarantees atomic claims and atomic retirement. The controller
//! adds what the store does not know: argument checks, the pause switch,
//! timing of executions, status counters, and how outcomes are archived.
//!
//! ```text
//! PENDING --peek--> IN_PROGRESS --remove--> SUCCESS | FAILED | CANCELED
//! PENDING | IN_PROGRESS --cancel/clear--> CANCELED
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use super::diagnostics;
use crate::clock::Clock;
use crate::db::QueueStore;
use crate::error::{Error, Result};
use crate::ids::UuidFactory;
use crate::model::{
    ActivityQuery, ActivityRecord, ActivityStatus, QueueCounts, QueueFilter, Task, TaskId,
    TaskResult, TaskStatus, TaskSubmit,
};
use crate::status::{QueueStatus, StatusSnapshot};
use crate::telemetry::metrics;

/// Public lifecycle API of the queue.
///
/// Cheap to clone; clones share the store, the counters and the pause flag.
pub struct QueueController<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    uuids: Arc<dyn UuidFactory>,
    status: Arc<dyn QueueStatus>,
    peek_paused: Arc<AtomicBool>,
}

impl<S> Clone for QueueController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            uuids: Arc::clone(&self.uuids),
            status: Arc::clone(&self.status),
            peek_paused: Arc::clone(&self.peek_paused),
        }
    }
}

impl<S: QueueStore> QueueController<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        uuids: Arc<dyn UuidFactory>,
        status: Arc<dyn QueueStatus>,
    ) -> Self {
        Self {
            store,
            clock,
            uuids,
            status,
            peek_paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Queue a new task. Identity and submission time are assigned here.
    pub async fn submit(&self, submit: TaskSubmit) -> Result<Task> {
        if submit.task_type.trim().is_empty() {
            return Err(Error::InvalidArgument("task type can't be empty".into()));
        }
        let task = submit.into_task(self.uuids.create(), self.clock.now());
        self.store.enqueue(&task).await?;

        self.status.add_received();
        metrics::task_submitted().add(1, &[KeyValue::new("task_type", task.task_type.clone())]);
        info!(task_id = %task.id, task_type = %task.task_type, "task submitted");
        Ok(task)
    }

    /// Claim the oldest pending task for `worker_id`.
    ///
    /// Returns `None` when the queue is empty or peeking is paused. Never
    /// waits for work to arrive.
    pub async fn peek(&self, worker_id: &str) -> Result<Option<Task>> {
        if worker_id.trim().is_empty() {
            return Err(Error::InvalidArgument("worker id can't be empty".into()));
        }
        if self.peek_paused.load(Ordering::Acquire) {
            return Ok(None);
        }

        let task = self.store.peek(worker_id, self.clock.now()).await?;
        if let Some(ref task) = task {
            self.status.add_in_progress();
            debug!(
                task_id = %task.id,
                worker_id,
                attempt = task.execution_count,
                "task claimed"
            );
        }
        Ok(task)
    }

    /// Retire a claimed task with its outcome.
    ///
    /// `error` may only accompany [`ActivityStatus::Failed`]. Fails with
    /// [`Error::NotFound`] when `task` no longer holds the claim in the
    /// queue: it was already removed, canceled, or claimed again since
    /// (another worker, or the same worker on a later attempt).
    pub async fn remove(
        &self,
        task: &Task,
        status: ActivityStatus,
        result: Option<&TaskResult>,
        error: Option<&anyhow::Error>,
    ) -> Result<()> {
        if error.is_some() && status != ActivityStatus::Failed {
            return Err(Error::InvalidArgument(
                "error can be provided only when status is FAILED".into(),
            ));
        }

        let queued = self
            .store
            .select_by_uuid(task.id)
            .await?
            .filter(|t| {
                t.status == TaskStatus::InProgress
                    && t.worker_id == task.worker_id
                    && t.execution_count == task.execution_count
            })
            .ok_or_else(|| Error::NotFound(format!("task does not exist anymore: {}", task.id)))?;

        let mut activity = ActivityRecord::from_task(&queued, status);
        let duration_ms = self.stamp_execution(&mut activity);
        if let Some(analysis_id) = result.and_then(|r| r.analysis_id.clone()) {
            activity.analysis_id = Some(analysis_id);
        }
        if let Some(error) = error {
            activity.error_message = diagnostics::error_message(error);
            activity.error_stacktrace = diagnostics::stacktrace_for_persistence(error);
        }

        self.store.remove_and_archive(&activity).await?;

        if let Some(duration_ms) = duration_ms {
            if status == ActivityStatus::Success {
                self.status.add_success(duration_ms);
            } else {
                self.status.add_error(duration_ms);
            }
        }
        info!(
            task_id = %task.id,
            status = %status,
            duration_ms,
            "task removed"
        );
        Ok(())
    }

    /// Set executed-at and execution time. Tasks that were never started
    /// carry no timing.
    fn stamp_execution(&self, activity: &mut ActivityRecord) -> Option<i64> {
        let started_at = activity.started_at?;
        let executed_at = self.clock.now();
        let duration_ms = executed_at - started_at;
        activity.executed_at = Some(executed_at);
        activity.execution_time_ms = Some(duration_ms);
        Some(duration_ms)
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Cancel one task, pending or claimed, without execution accounting.
    ///
    /// Returns `false` if the task had already left the queue. A worker still
    /// running a canceled task is not interrupted; its `remove` will fail.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        let Some(task) = self.store.cancel(id).await? else {
            return Ok(false);
        };
        match task.status {
            TaskStatus::Pending => self.status.add_canceled(1, 0),
            TaskStatus::InProgress => self.status.add_canceled(0, 1),
        }
        info!(task_id = %id, was = %task.status, "task canceled");
        Ok(true)
    }

    /// Cancel every pending task. Claimed tasks are left alone.
    pub async fn cancel_pending(&self) -> Result<usize> {
        self.cancel_all(false).await
    }

    /// Cancel every task in the queue, claimed ones included.
    pub async fn clear(&self) -> Result<usize> {
        self.cancel_all(true).await
    }

    async fn cancel_all(&self, include_in_progress: bool) -> Result<usize> {
        let canceled = self.store.cancel_all(include_in_progress).await?;
        let in_progress = canceled
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count() as u64;
        let pending = canceled.len() as u64 - in_progress;
        self.status.add_canceled(pending, in_progress);

        if in_progress > 0 {
            warn!(
                in_progress,
                "canceled tasks still held by workers; their results will be rejected"
            );
        }
        info!(count = canceled.len(), forced = include_in_progress, "tasks canceled");
        Ok(canceled.len())
    }

    /// Stop handing out tasks. Claims already made are unaffected.
    pub fn pause_peek(&self) {
        self.peek_paused.store(true, Ordering::Release);
        info!("peek paused");
    }

    pub fn resume_peek(&self) {
        self.peek_paused.store(false, Ordering::Release);
        info!("peek resumed");
    }

    pub fn is_peek_paused(&self) -> bool {
        self.peek_paused.load(Ordering::Acquire)
    }

    /// Startup recovery for the workers named in `worker_ids`.
    ///
    /// Claims those workers held when the previous process stopped can never
    /// be reported, so the tasks go back to PENDING (keeping their execution
    /// count). Claims of other workers, possibly live in another process,
    /// are left alone. Counters are then seeded from the store. Returns the
    /// number of tasks put back.
    pub async fn recover(&self, worker_ids: &[String]) -> Result<u64> {
        let reset = self.store.reset_in_progress(worker_ids).await?;
        if reset > 0 {
            warn!(count = reset, "returned orphaned in-progress tasks to the queue");
        }

        let counts = self.store.count_by_status().await?;
        let totals = self.store.count_activities().await?;
        self.status.seed(
            StatusSnapshot {
                pending: counts.pending,
                in_progress: counts.in_progress,
                ..Default::default()
            }
            .with_archive_totals(&totals),
        );
        info!(
            pending = counts.pending,
            in_progress = counts.in_progress,
            "queue status seeded"
        );
        Ok(reset)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        self.store.select_by_uuid(id).await
    }

    pub async fn queue(&self, filter: &QueueFilter) -> Result<Vec<Task>> {
        self.store.list_queue(filter).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.store.count_by_status().await
    }

    pub async fn activity(&self, id: TaskId) -> Result<Option<ActivityRecord>> {
        self.store.select_activity(id).await
    }

    pub async fn activities(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>> {
        query.validate()?;
        self.store.select_activities(query).await
    }
}
