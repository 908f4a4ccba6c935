//! Activity archive on Postgres.
//!
//! Rows are written once, inside the transaction that removes the task
//! from the queue. The only later change is clearing `is_last` when a newer
//! activity for the same (task type, component) arrives.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{ActivityQuery, ActivityRecord, ActivityStatus, TaskId};

const ACTIVITY_COLUMNS: &str = "uuid, task_type, component_id, submitter, status, submitted_at, started_at, executed_at, execution_time_ms, execution_count, worker_id, analysis_id, error_message, error_stacktrace, is_last";

/// Insert an activity record within an open transaction.
pub(super) async fn archive_on(
    tx: &mut Transaction<'_, Postgres>,
    activity: &ActivityRecord,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_activity SET is_last = false
         WHERE is_last AND task_type = $1 AND component_id IS NOT DISTINCT FROM $2",
    )
    .bind(&activity.task_type)
    .bind(&activity.component_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO task_activity ({ACTIVITY_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, true)"
    ))
    .bind(activity.id.0)
    .bind(&activity.task_type)
    .bind(&activity.component_id)
    .bind(&activity.submitter)
    .bind(activity.status.as_str())
    .bind(activity.submitted_at)
    .bind(activity.started_at)
    .bind(activity.executed_at)
    .bind(activity.execution_time_ms)
    .bind(activity.execution_count as i32)
    .bind(&activity.worker_id)
    .bind(&activity.analysis_id)
    .bind(&activity.error_message)
    .bind(&activity.error_stacktrace)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

impl super::Db {
    /// Get an archived activity by task ID.
    pub async fn get_activity(&self, id: TaskId) -> Result<Option<ActivityRecord>> {
        let row: Option<ActivityRow> = sqlx::query_as(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM task_activity WHERE uuid = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(ActivityRow::try_into_activity).transpose()
    }

    /// Search the archive, newest submission first. Equal submission times
    /// list the most recently archived first.
    pub async fn list_activities(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>> {
        query.validate()?;

        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let rows: Vec<ActivityRow> = sqlx::query_as(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM task_activity
             WHERE ($1::uuid IS NULL OR uuid = $1)
               AND ($2::varchar IS NULL OR component_id = $2)
               AND ($3::varchar IS NULL OR task_type = $3)
               AND (cardinality($4::text[]) = 0 OR status = ANY($4))
               AND (NOT $5::boolean OR is_last)
               AND ($6::bigint IS NULL OR submitted_at >= $6)
               AND ($7::bigint IS NULL OR executed_at <= $7)
               AND ($8::varchar IS NULL OR component_id ILIKE '%' || $8 || '%')
             ORDER BY submitted_at DESC, seq DESC
             LIMIT $9 OFFSET $10"
        ))
        .bind(query.task_id.map(|id| id.0))
        .bind(&query.component_id)
        .bind(&query.task_type)
        .bind(&statuses)
        .bind(query.only_currents)
        .bind(query.min_submitted_at)
        .bind(query.max_executed_at)
        .bind(query.component_query.as_deref().map(escape_like))
        .bind(query.page_size as i64)
        .bind(query.offset() as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ActivityRow::try_into_activity).collect()
    }

    /// Count archived activities per terminal status.
    pub async fn count_activities(&self) -> Result<Vec<(ActivityStatus, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM task_activity GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        rows.into_iter()
            .map(|(status, count)| -> Result<(ActivityStatus, u64)> {
                Ok((status.parse()?, count as u64))
            })
            .collect()
    }
}

/// Match `%`, `_` and `\` literally in a LIKE pattern.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ActivityRow {
    uuid: Uuid,
    task_type: String,
    component_id: Option<String>,
    submitter: Option<String>,
    status: String,
    submitted_at: i64,
    started_at: Option<i64>,
    executed_at: Option<i64>,
    execution_time_ms: Option<i64>,
    execution_count: i32,
    worker_id: Option<String>,
    analysis_id: Option<String>,
    error_message: Option<String>,
    error_stacktrace: Option<String>,
    is_last: bool,
}

impl ActivityRow {
    fn try_into_activity(self) -> Result<ActivityRecord> {
        Ok(ActivityRecord {
            id: TaskId(self.uuid),
            task_type: self.task_type,
            component_id: self.component_id,
            submitter: self.submitter,
            status: self.status.parse()?,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            executed_at: self.executed_at,
            execution_time_ms: self.execution_time_ms,
            execution_count: self.execution_count.max(0) as u32,
            worker_id: self.worker_id,
            analysis_id: self.analysis_id,
            error_message: self.error_message,
            error_stacktrace: self.error_stacktrace,
            is_last: self.is_last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::escape_like;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("billing"), "billing");
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }
}
