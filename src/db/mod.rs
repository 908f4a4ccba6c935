//! Durable task storage.
//!
//! [`QueueStore`] is the storage contract the controller is written against:
//! the live queue plus the activity archive. [`Db`] implements it on Postgres;
//! [`MemoryStore`] implements it in-process for tests and embedded use.
//!
//! Every operation runs in its own transaction. Operations that move a task
//! out of the queue delete the row and write its activity record in that
//! same transaction.

pub mod activity;
pub mod memory;
pub mod queue;

pub use memory::MemoryStore;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{
    ActivityQuery, ActivityRecord, ActivityStatus, QueueCounts, QueueFilter, Task, TaskId,
};

/// Storage contract for the live queue and the activity archive.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new PENDING task. `Error::Conflict` if the UUID exists.
    async fn enqueue(&self, task: &Task) -> Result<()>;

    /// Atomically claim the oldest PENDING task for `worker_id`.
    ///
    /// Two concurrent callers never receive the same task. Returns `None`
    /// when nothing is eligible; never waits.
    async fn peek(&self, worker_id: &str, now: i64) -> Result<Option<Task>>;

    async fn select_by_uuid(&self, id: TaskId) -> Result<Option<Task>>;

    /// Delete the IN_PROGRESS row for `activity.id` and archive `activity`.
    ///
    /// The row must still carry the claim recorded in the activity (same
    /// worker and execution count). `Error::NotFound` otherwise: the task was
    /// already removed, canceled, or claimed again since.
    async fn remove_and_archive(&self, activity: &ActivityRecord) -> Result<()>;

    /// Cancel one task whatever its status. Returns the task as it was.
    async fn cancel(&self, id: TaskId) -> Result<Option<Task>>;

    /// Cancel every PENDING task, and IN_PROGRESS ones too when
    /// `include_in_progress`. Returns the canceled tasks.
    async fn cancel_all(&self, include_in_progress: bool) -> Result<Vec<Task>>;

    /// Return the IN_PROGRESS tasks claimed by `worker_ids` to PENDING.
    ///
    /// Used at startup by an instance for its own workers, which cannot
    /// still be running anything. Claims held by other workers are untouched.
    async fn reset_in_progress(&self, worker_ids: &[String]) -> Result<u64>;

    async fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<Task>>;

    async fn count_by_status(&self) -> Result<QueueCounts>;

    async fn select_activity(&self, id: TaskId) -> Result<Option<ActivityRecord>>;

    async fn select_activities(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>>;

    /// Archived activity totals per terminal status.
    async fn count_activities(&self) -> Result<Vec<(ActivityStatus, u64)>>;
}

/// Postgres handle. Owns the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for Db {
    async fn enqueue(&self, task: &Task) -> Result<()> {
        self.insert_task(task).await
    }

    async fn peek(&self, worker_id: &str, now: i64) -> Result<Option<Task>> {
        self.claim_next(worker_id, now).await
    }

    async fn select_by_uuid(&self, id: TaskId) -> Result<Option<Task>> {
        self.get_task(id).await
    }

    async fn remove_and_archive(&self, activity: &ActivityRecord) -> Result<()> {
        self.retire_task(activity).await
    }

    async fn cancel(&self, id: TaskId) -> Result<Option<Task>> {
        self.cancel_task(id).await
    }

    async fn cancel_all(&self, include_in_progress: bool) -> Result<Vec<Task>> {
        self.cancel_tasks(include_in_progress).await
    }

    async fn reset_in_progress(&self, worker_ids: &[String]) -> Result<u64> {
        self.reset_claims(worker_ids).await
    }

    async fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<Task>> {
        self.list_tasks(filter).await
    }

    async fn count_by_status(&self) -> Result<QueueCounts> {
        self.count_tasks().await
    }

    async fn select_activity(&self, id: TaskId) -> Result<Option<ActivityRecord>> {
        self.get_activity(id).await
    }

    async fn select_activities(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>> {
        self.list_activities(query).await
    }

    async fn count_activities(&self) -> Result<Vec<(ActivityStatus, u64)>> {
        Db::count_activities(self).await
    }
}
