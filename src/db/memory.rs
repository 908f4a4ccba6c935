//! In-process [`QueueStore`].
//!
//! One mutex guards the queue and the archive together, and every
//! operation completes inside a single critical section, so a claim or a
//! removal is as atomic here as a transaction is on Postgres. Nothing
//! survives the process.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::QueueStore;
use crate::error::{Error, Result};
use crate::model::{
    ActivityQuery, ActivityRecord, ActivityStatus, QueueCounts, QueueFilter, Task, TaskId,
    TaskStatus,
};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Task plus its insertion sequence, which breaks submitted_at ties.
    queue: HashMap<TaskId, (u64, Task)>,
    /// Insertion order.
    archive: Vec<ActivityRecord>,
    next_seq: u64,
}

impl Inner {
    fn push_activity(&mut self, mut activity: ActivityRecord) {
        for previous in self.archive.iter_mut().filter(|a| a.is_last) {
            if previous.same_lineage(&activity) {
                previous.is_last = false;
            }
        }
        activity.is_last = true;
        self.archive.push(activity);
    }

    /// Queue entries in FIFO order.
    fn ordered(&self) -> Vec<&(u64, Task)> {
        let mut entries: Vec<_> = self.queue.values().collect();
        entries.sort_by_key(|(seq, task)| (task.submitted_at, *seq));
        entries
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.queue.contains_key(&task.id) || inner.archive.iter().any(|a| a.id == task.id) {
            return Err(Error::Conflict(format!("task {} is already queued", task.id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.insert(task.id, (seq, task.clone()));
        Ok(())
    }

    async fn peek(&self, worker_id: &str, now: i64) -> Result<Option<Task>> {
        let mut inner = self.inner.lock();
        let next = inner
            .ordered()
            .into_iter()
            .find(|(_, task)| task.status == TaskStatus::Pending)
            .map(|(_, task)| task.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some((_, task)) = inner.queue.get_mut(&id) else {
            return Ok(None);
        };
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        task.worker_id = Some(worker_id.to_string());
        task.execution_count += 1;
        Ok(Some(task.clone()))
    }

    async fn select_by_uuid(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.inner.lock().queue.get(&id).map(|(_, task)| task.clone()))
    }

    async fn remove_and_archive(&self, activity: &ActivityRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let claimed = inner.queue.get(&activity.id).is_some_and(|(_, task)| {
            task.status == TaskStatus::InProgress
                && task.worker_id == activity.worker_id
                && task.execution_count == activity.execution_count
        });
        if !claimed {
            return Err(Error::NotFound(format!(
                "task does not exist anymore: {}",
                activity.id
            )));
        }
        inner.queue.remove(&activity.id);
        inner.push_activity(activity.clone());
        Ok(())
    }

    async fn cancel(&self, id: TaskId) -> Result<Option<Task>> {
        let mut inner = self.inner.lock();
        let Some((_, task)) = inner.queue.remove(&id) else {
            return Ok(None);
        };
        inner.push_activity(ActivityRecord::from_task(&task, ActivityStatus::Canceled));
        Ok(Some(task))
    }

    async fn cancel_all(&self, include_in_progress: bool) -> Result<Vec<Task>> {
        let mut inner = self.inner.lock();
        let targets: Vec<TaskId> = inner
            .ordered()
            .into_iter()
            .filter(|(_, task)| include_in_progress || task.status == TaskStatus::Pending)
            .map(|(_, task)| task.id)
            .collect();

        let mut canceled = Vec::with_capacity(targets.len());
        for id in targets {
            if let Some((_, task)) = inner.queue.remove(&id) {
                inner.push_activity(ActivityRecord::from_task(&task, ActivityStatus::Canceled));
                canceled.push(task);
            }
        }
        Ok(canceled)
    }

    async fn reset_in_progress(&self, worker_ids: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut reset = 0;
        for (_, task) in inner.queue.values_mut() {
            let ours = task
                .worker_id
                .as_ref()
                .is_some_and(|w| worker_ids.contains(w));
            if task.status == TaskStatus::InProgress && ours {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.worker_id = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<Task>> {
        let inner = self.inner.lock();
        Ok(inner
            .ordered()
            .into_iter()
            .map(|(_, task)| task)
            .filter(|task| filter.matches(task))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<QueueCounts> {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for (_, task) in inner.queue.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
            }
        }
        Ok(counts)
    }

    async fn select_activity(&self, id: TaskId) -> Result<Option<ActivityRecord>> {
        Ok(self
            .inner
            .lock()
            .archive
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn select_activities(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>> {
        query.validate()?;
        let inner = self.inner.lock();
        let mut matching: Vec<&ActivityRecord> = inner
            .archive
            .iter()
            .rev()
            .filter(|a| query.matches(a))
            .collect();
        // Stable: equal submissions keep newest-archived first.
        matching.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(matching
            .into_iter()
            .skip(query.offset())
            .take(query.page_size)
            .cloned()
            .collect())
    }

    async fn count_activities(&self) -> Result<Vec<(ActivityStatus, u64)>> {
        let inner = self.inner.lock();
        let mut counts: Vec<(ActivityStatus, u64)> = Vec::new();
        for activity in &inner.archive {
            match counts.iter_mut().find(|(s, _)| *s == activity.status) {
                Some((_, n)) => *n += 1,
                None => counts.push((activity.status, 1)),
            }
        }
        Ok(counts)
    }
}
