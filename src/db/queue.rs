//! Live queue operations on Postgres: enqueue, claim, retire, cancel.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single UPDATE so concurrent
//! workers never see the same row. Retirement deletes the row and archives
//! it in one transaction.

use opentelemetry::KeyValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    ActivityRecord, ActivityStatus, QueueCounts, QueueFilter, Task, TaskId, TaskStatus,
};
use crate::telemetry::metrics;

const TASK_COLUMNS: &str = "uuid, task_type, component_id, submitter, status, submitted_at, started_at, worker_id, execution_count";

fn record_operation(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}

impl super::Db {
    /// Insert a PENDING task. A UUID already queued or archived is a conflict.
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO task_queue (uuid, task_type, component_id, submitter, status, submitted_at, started_at, worker_id, execution_count)
             SELECT $1::uuid, $2::varchar, $3::varchar, $4::varchar, $5::varchar, $6::bigint, $7::bigint, $8::varchar, $9::integer
             WHERE NOT EXISTS (SELECT 1 FROM task_activity WHERE uuid = $1)",
        )
        .bind(task.id.0)
        .bind(&task.task_type)
        .bind(&task.component_id)
        .bind(&task.submitter)
        .bind(task.status.as_str())
        .bind(task.submitted_at)
        .bind(task.started_at)
        .bind(&task.worker_id)
        .bind(task.execution_count as i32)
        .execute(self.pool())
        .await;

        let conflict = || Error::Conflict(format!("task {} is already queued", task.id));
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(conflict()),
            Ok(_) => {
                record_operation("enqueue");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(conflict()),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the oldest PENDING task for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str, now: i64) -> Result<Option<Task>> {
        let mut tx = self.pool().begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE task_queue
             SET status = 'IN_PROGRESS', started_at = $1, worker_id = $2, execution_count = execution_count + 1
             WHERE status = 'PENDING' AND uuid = (
                 SELECT uuid FROM task_queue
                 WHERE status = 'PENDING'
                 ORDER BY submitted_at ASC, seq ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(now)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        record_operation(if row.is_some() { "peek" } else { "peek_empty" });
        row.map(TaskRow::try_into_task).transpose()
    }

    /// Get a queued task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM task_queue WHERE uuid = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    /// Delete an IN_PROGRESS task and archive its outcome, provided the
    /// claim recorded in `activity` is still the current one.
    pub async fn retire_task(&self, activity: &ActivityRecord) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let rows_affected = sqlx::query(
            "DELETE FROM task_queue
             WHERE uuid = $1 AND status = 'IN_PROGRESS'
               AND worker_id IS NOT DISTINCT FROM $2 AND execution_count = $3",
        )
        .bind(activity.id.0)
        .bind(&activity.worker_id)
        .bind(activity.execution_count as i32)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // tx rolls back on drop
            return Err(Error::NotFound(format!(
                "task does not exist anymore: {}",
                activity.id
            )));
        }

        super::activity::archive_on(&mut tx, activity).await?;
        tx.commit().await?;

        record_operation("remove");
        Ok(())
    }

    /// Cancel one task, pending or in progress.
    pub async fn cancel_task(&self, id: TaskId) -> Result<Option<Task>> {
        let mut tx = self.pool().begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "DELETE FROM task_queue WHERE uuid = $1 RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let task = row.try_into_task()?;

        super::activity::archive_on(
            &mut tx,
            &ActivityRecord::from_task(&task, ActivityStatus::Canceled),
        )
        .await?;
        tx.commit().await?;

        record_operation("cancel");
        Ok(Some(task))
    }

    /// Cancel pending tasks, and in-progress ones when `include_in_progress`.
    pub async fn cancel_tasks(&self, include_in_progress: bool) -> Result<Vec<Task>> {
        let mut tx = self.pool().begin().await?;

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "DELETE FROM task_queue WHERE $1::boolean OR status = 'PENDING' RETURNING {TASK_COLUMNS}"
        ))
        .bind(include_in_progress)
        .fetch_all(&mut *tx)
        .await?;

        let mut tasks = rows
            .into_iter()
            .map(TaskRow::try_into_task)
            .collect::<Result<Vec<_>>>()?;
        // Archive in submission order so the newest of each lineage ends up last.
        tasks.sort_by_key(|t| t.submitted_at);

        for task in &tasks {
            super::activity::archive_on(
                &mut tx,
                &ActivityRecord::from_task(task, ActivityStatus::Canceled),
            )
            .await?;
        }
        tx.commit().await?;

        record_operation(if include_in_progress { "clear" } else { "cancel_pending" });
        Ok(tasks)
    }

    /// Return the IN_PROGRESS tasks held by `worker_ids` to PENDING.
    pub async fn reset_claims(&self, worker_ids: &[String]) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE task_queue SET status = 'PENDING', started_at = NULL, worker_id = NULL
             WHERE status = 'IN_PROGRESS' AND worker_id = ANY($1)",
        )
        .bind(worker_ids)
        .execute(self.pool())
        .await?
        .rows_affected();

        record_operation("reset");
        Ok(rows_affected)
    }

    /// List queued tasks, oldest first.
    pub async fn list_tasks(&self, filter: &QueueFilter) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM task_queue
             WHERE ($1::varchar IS NULL OR status = $1)
               AND ($2::varchar IS NULL OR task_type = $2)
               AND ($3::varchar IS NULL OR component_id = $3)
             ORDER BY submitted_at ASC, seq ASC
             LIMIT $4"
        ))
        .bind(filter.status.map(TaskStatus::as_str))
        .bind(&filter.task_type)
        .bind(&filter.component_id)
        .bind(filter.limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// Count queued tasks per status.
    pub async fn count_tasks(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM task_queue GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => counts.pending = count as u64,
                TaskStatus::InProgress => counts.in_progress = count as u64,
            }
        }
        Ok(counts)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    uuid: Uuid,
    task_type: String,
    component_id: Option<String>,
    submitter: Option<String>,
    status: String,
    submitted_at: i64,
    started_at: Option<i64>,
    worker_id: Option<String>,
    execution_count: i32,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.uuid),
            task_type: self.task_type,
            component_id: self.component_id,
            submitter: self.submitter,
            status: self.status.parse()?,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            worker_id: self.worker_id,
            execution_count: self.execution_count.max(0) as u32,
        })
    }
}
