//! Running queue aggregates for monitoring.
//!
//! Updates are lock-free and never fail. They are not synchronized with the
//! store's transactions and are lost on restart; [`QueueController::recover`]
//! seeds them again from the store.
//!
//! [`QueueController::recover`]: crate::engine::QueueController::recover

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::KeyValue;

use crate::model::ActivityStatus;
use crate::telemetry::metrics;

/// Sink for queue lifecycle counters.
pub trait QueueStatus: Send + Sync {
    /// A task was submitted.
    fn add_received(&self);

    /// A worker claimed a task.
    fn add_in_progress(&self);

    /// A claimed task finished successfully after `duration_ms`.
    fn add_success(&self, duration_ms: i64);

    /// A claimed task failed (or was canceled by its worker) after `duration_ms`.
    fn add_error(&self, duration_ms: i64);

    /// `pending` and `in_progress` tasks left the queue without an outcome
    /// being reported (administrative cancellation).
    fn add_canceled(&self, pending: u64, in_progress: u64);

    /// Reset gauges and totals to values read from the store.
    fn seed(&self, snapshot: StatusSnapshot);
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub pending: u64,
    pub in_progress: u64,
    pub success: u64,
    pub error: u64,
    pub canceled: u64,
    pub processing_time_ms: u64,
}

impl StatusSnapshot {
    /// Build totals from archived activity counts.
    pub fn with_archive_totals(mut self, totals: &[(ActivityStatus, u64)]) -> Self {
        for (status, count) in totals {
            match status {
                ActivityStatus::Success => self.success = *count,
                ActivityStatus::Failed => self.error = *count,
                ActivityStatus::Canceled => self.canceled = *count,
            }
        }
        self
    }
}

/// Atomic counters, also forwarded to the OTel instruments.
#[derive(Debug, Default)]
pub struct StatusCounters {
    pending: AtomicU64,
    in_progress: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    canceled: AtomicU64,
    processing_time_ms: AtomicU64,
}

/// Decrement without wrapping below zero.
fn saturating_sub(cell: &AtomicU64, n: u64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    });
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn in_progress_count(&self) -> u64 {
        self.in_progress.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn canceled_count(&self) -> u64 {
        self.canceled.load(Ordering::Relaxed)
    }

    /// Cumulative execution time of finished tasks.
    pub fn processing_time_ms(&self) -> u64 {
        self.processing_time_ms.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            pending: self.pending_count(),
            in_progress: self.in_progress_count(),
            success: self.success_count(),
            error: self.error_count(),
            canceled: self.canceled_count(),
            processing_time_ms: self.processing_time_ms(),
        }
    }

    fn add_finished(&self, counter: &AtomicU64, label: &'static str, duration_ms: i64) {
        counter.fetch_add(1, Ordering::Relaxed);
        saturating_sub(&self.in_progress, 1);
        let duration = duration_ms.max(0) as u64;
        self.processing_time_ms.fetch_add(duration, Ordering::Relaxed);

        metrics::tasks_in_progress().add(-1, &[]);
        metrics::task_completed().add(1, &[KeyValue::new("status", label)]);
        metrics::task_duration_ms().record(duration as f64, &[KeyValue::new("status", label)]);
    }
}

impl QueueStatus for StatusCounters {
    fn add_received(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    fn add_in_progress(&self) {
        self.in_progress.fetch_add(1, Ordering::Relaxed);
        saturating_sub(&self.pending, 1);
        metrics::tasks_in_progress().add(1, &[]);
        metrics::task_claimed().add(1, &[]);
    }

    fn add_success(&self, duration_ms: i64) {
        self.add_finished(&self.success, "success", duration_ms);
    }

    fn add_error(&self, duration_ms: i64) {
        self.add_finished(&self.error, "error", duration_ms);
    }

    fn add_canceled(&self, pending: u64, in_progress: u64) {
        saturating_sub(&self.pending, pending);
        saturating_sub(&self.in_progress, in_progress);
        self.canceled.fetch_add(pending + in_progress, Ordering::Relaxed);
        metrics::tasks_in_progress().add(-(in_progress as i64), &[]);
        metrics::task_canceled().add(pending + in_progress, &[]);
    }

    fn seed(&self, snapshot: StatusSnapshot) {
        self.pending.store(snapshot.pending, Ordering::Relaxed);
        self.in_progress.store(snapshot.in_progress, Ordering::Relaxed);
        self.success.store(snapshot.success, Ordering::Relaxed);
        self.error.store(snapshot.error, Ordering::Relaxed);
        self.canceled.store(snapshot.canceled, Ordering::Relaxed);
        self.processing_time_ms
            .store(snapshot.processing_time_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_error_release_the_claim() {
        let counters = StatusCounters::new();
        counters.add_received();
        counters.add_received();
        counters.add_in_progress();
        counters.add_in_progress();
        assert_eq!(counters.pending_count(), 0);
        assert_eq!(counters.in_progress_count(), 2);

        counters.add_success(500);
        counters.add_error(250);

        assert_eq!(counters.in_progress_count(), 0);
        assert_eq!(counters.success_count(), 1);
        assert_eq!(counters.error_count(), 1);
        assert_eq!(counters.processing_time_ms(), 750);
    }

    #[test]
    fn gauges_never_wrap_below_zero() {
        let counters = StatusCounters::new();
        counters.add_success(10);
        counters.add_canceled(3, 2);
        assert_eq!(counters.in_progress_count(), 0);
        assert_eq!(counters.pending_count(), 0);
        assert_eq!(counters.canceled_count(), 5);
    }

    #[test]
    fn seed_replaces_every_counter() {
        let counters = StatusCounters::new();
        counters.add_in_progress();
        let snapshot = StatusSnapshot {
            pending: 4,
            ..Default::default()
        }
        .with_archive_totals(&[(ActivityStatus::Success, 7), (ActivityStatus::Failed, 2)]);
        counters.seed(snapshot);
        assert_eq!(counters.snapshot(), snapshot);
        assert_eq!(counters.success_count(), 7);
        assert_eq!(counters.in_progress_count(), 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let counters = std::sync::Arc::new(StatusCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = std::sync::Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.add_in_progress();
                        counters.add_success(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.success_count(), 8000);
        assert_eq!(counters.processing_time_ms(), 8000);
    }
}
