//! Core data model.
//!
//! A task is deferred work waiting in the queue. Once it reaches a terminal
//! outcome it leaves the queue and becomes an activity record in the archive.
//! All timestamps are epoch milliseconds taken from the injected clock.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A queued task: pending, or claimed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// What kind of task this is (e.g. "REPORT"). Workers route on it.
    pub task_type: String,

    /// Owning scope (project/component key). Opaque to the queue.
    pub component_id: Option<String>,

    /// Login of whoever submitted the task.
    pub submitter: Option<String>,

    pub status: TaskStatus,

    pub submitted_at: i64,

    /// Set when a worker claims the task.
    pub started_at: Option<i64>,

    /// The claiming worker. At most one at a time.
    pub worker_id: Option<String>,

    /// Number of times the task has been claimed.
    pub execution_count: u32,
}

/// Newtype for task identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| Error::InvalidArgument(format!("invalid task id '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a task that is still in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            _ => Err(Error::InvalidArgument(format!("unknown task status: {s}"))),
        }
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    Success,
    Failed,
    Canceled,
}

impl ActivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::Success => "SUCCESS",
            ActivityStatus::Failed => "FAILED",
            ActivityStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(ActivityStatus::Success),
            "FAILED" => Ok(ActivityStatus::Failed),
            "CANCELED" => Ok(ActivityStatus::Canceled),
            _ => Err(Error::InvalidArgument(format!("unknown activity status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// Archived terminal outcome of a task. Shares the task's UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: TaskId,
    pub task_type: String,
    pub component_id: Option<String>,
    pub submitter: Option<String>,
    pub status: ActivityStatus,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub executed_at: Option<i64>,
    /// `executed_at - started_at`, when the task was ever claimed.
    pub execution_time_ms: Option<i64>,
    pub execution_count: u32,
    pub worker_id: Option<String>,
    /// Reference to whatever the task produced.
    pub analysis_id: Option<String>,
    pub error_message: Option<String>,
    pub error_stacktrace: Option<String>,
    /// Most recent activity for its (task type, component) pair.
    pub is_last: bool,
}

impl ActivityRecord {
    /// Start an activity record from the queue row it retires.
    pub fn from_task(task: &Task, status: ActivityStatus) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            component_id: task.component_id.clone(),
            submitter: task.submitter.clone(),
            status,
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            executed_at: None,
            execution_time_ms: None,
            execution_count: task.execution_count,
            worker_id: task.worker_id.clone(),
            analysis_id: None,
            error_message: None,
            error_stacktrace: None,
            is_last: true,
        }
    }

    /// Whether `other` belongs to the same (task type, component) pair.
    pub(crate) fn same_lineage(&self, other: &ActivityRecord) -> bool {
        self.task_type == other.task_type && self.component_id == other.component_id
    }
}

/// What a worker hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub analysis_id: Option<String>,
}

impl TaskResult {
    pub fn with_analysis(analysis_id: impl Into<String>) -> Self {
        Self {
            analysis_id: Some(analysis_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new tasks. The controller assigns identity and timestamps.
#[derive(Debug, Clone)]
pub struct TaskSubmit {
    pub(crate) task_type: String,
    pub(crate) component_id: Option<String>,
    pub(crate) submitter: Option<String>,
}

impl TaskSubmit {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            component_id: None,
            submitter: None,
        }
    }

    pub fn component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = Some(component_id.into());
        self
    }

    pub fn submitter(mut self, login: impl Into<String>) -> Self {
        self.submitter = Some(login.into());
        self
    }

    pub(crate) fn into_task(self, id: TaskId, submitted_at: i64) -> Task {
        Task {
            id,
            task_type: self.task_type,
            component_id: self.component_id,
            submitter: self.submitter,
            status: TaskStatus::Pending,
            submitted_at,
            started_at: None,
            worker_id: None,
            execution_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for listing the live queue. Results are oldest first.
#[derive(Debug, Clone)]
pub struct QueueFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub component_id: Option<String>,
    pub limit: usize,
}

impl Default for QueueFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            component_id: None,
            limit: 100,
        }
    }
}

impl QueueFilter {
    pub(crate) fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| t == task.task_type)
            && self
                .component_id
                .as_deref()
                .is_none_or(|c| task.component_id.as_deref() == Some(c))
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Criteria for reading the activity archive. Results are newest first.
#[derive(Debug, Clone)]
pub struct ActivityQuery {
    pub task_id: Option<TaskId>,
    pub component_id: Option<String>,
    /// Substring of the component key, case-insensitive.
    pub component_query: Option<String>,
    pub task_type: Option<String>,
    /// Any of these statuses. Empty means all.
    pub statuses: Vec<ActivityStatus>,
    /// Only the latest activity per (task type, component).
    pub only_currents: bool,
    pub min_submitted_at: Option<i64>,
    pub max_executed_at: Option<i64>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for ActivityQuery {
    fn default() -> Self {
        Self {
            task_id: None,
            component_id: None,
            component_query: None,
            task_type: None,
            statuses: Vec::new(),
            only_currents: false,
            min_submitted_at: None,
            max_executed_at: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ActivityQuery {
    /// Reject out-of-range paging before it reaches the store.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.page == 0 {
            return Err(Error::InvalidArgument("page must be at least 1".into()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub(crate) fn offset(&self) -> usize {
        (self.page - 1) * self.page_size
    }

    pub(crate) fn matches(&self, record: &ActivityRecord) -> bool {
        self.task_id.is_none_or(|id| id == record.id)
            && self
                .component_id
                .as_deref()
                .is_none_or(|c| record.component_id.as_deref() == Some(c))
            && self.component_query.as_deref().is_none_or(|q| {
                record
                    .component_id
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&q.to_lowercase()))
            })
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| t == record.task_type)
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && (!self.only_currents || record.is_last)
            && self
                .min_submitted_at
                .is_none_or(|min| record.submitted_at >= min)
            && self
                .max_executed_at
                .is_none_or(|max| record.executed_at.is_some_and(|at| at <= max))
    }
}

/// Live queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_progress: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!("Canceled".parse::<ActivityStatus>().unwrap(), ActivityStatus::Canceled);
        assert!("done".parse::<ActivityStatus>().is_err());
    }

    #[test]
    fn activity_query_rejects_bad_paging() {
        let query = ActivityQuery {
            page: 0,
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = ActivityQuery {
            page_size: MAX_PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = ActivityQuery {
            page: 3,
            page_size: 20,
            ..Default::default()
        };
        assert!(query.validate().is_ok());
        assert_eq!(query.offset(), 40);
    }

    #[test]
    fn max_executed_at_excludes_never_executed() {
        let task = TaskSubmit::new("REPORT").into_task(TaskId(Uuid::new_v4()), 10);
        let record = ActivityRecord::from_task(&task, ActivityStatus::Canceled);
        let query = ActivityQuery {
            max_executed_at: Some(100),
            ..Default::default()
        };
        assert!(!query.matches(&record));
    }
}
