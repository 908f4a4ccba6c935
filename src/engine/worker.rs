//! Worker loop: poll the queue, run claimed tasks, report outcomes.
//!
//! The queue never blocks waiting for work, so the loop owns the polling
//! interval and its own shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::controller::QueueController;
use crate::db::QueueStore;
use crate::error::{Error, Result};
use crate::model::{ActivityStatus, Task, TaskResult};
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Executes the payload of one task type.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &Task) -> anyhow::Result<TaskResult>;
}

/// Processors indexed by task type.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn TaskProcessor>>,
}

impl ProcessorRegistry {
    /// Create an empty registry with no processors.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register `processor` for `task_type`, replacing any previous one.
    pub fn register(
        mut self,
        task_type: impl Into<String>,
        processor: impl TaskProcessor + 'static,
    ) -> Self {
        self.processors.insert(task_type.into(), Arc::new(processor));
        self
    }

    /// Look up the processor for a task type.
    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskProcessor>> {
        self.processors.get(task_type)
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }
}

/// Configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded on every claim.
    pub worker_id: String,
    /// Wait between polls when the queue is empty or paused.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// A polling worker bound to one controller.
pub struct Worker<S> {
    controller: QueueController<S>,
    registry: Arc<ProcessorRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl<S> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: QueueStore> Worker<S> {
    pub fn new(
        controller: QueueController<S>,
        registry: Arc<ProcessorRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            controller,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Signal the worker to stop after its current task.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Poll and process until shutdown.
    ///
    /// Keeps claiming back to back while work is available, and sleeps for
    /// the poll interval once the queue is empty, paused, or erroring.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "worker started");
        let mut idle = false;

        loop {
            let wait = if idle {
                self.config.poll_interval
            } else {
                Duration::ZERO
            };
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(worker_id = %self.config.worker_id, "worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, "worker poll error: {e}");
                    true
                }
            };
        }
    }

    /// Claim and process at most one task. Returns whether one was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let worker_id = self.config.worker_id.as_str();
        let Some(task) = self.controller.peek(worker_id).await? else {
            return Ok(false);
        };

        let span = start_task_span(&task, worker_id);
        record_state_transition(&span, "pending", "in_progress");

        async {
            let outcome = match self.registry.get(&task.task_type) {
                Some(processor) => processor.process(&task).await,
                None => {
                    warn!(task_type = %task.task_type, "no processor for task type");
                    Err(anyhow::anyhow!(
                        "no processor registered for task type {}",
                        task.task_type
                    ))
                }
            };

            let removed = match outcome {
                Ok(result) => {
                    record_state_transition(&span, "in_progress", "success");
                    self.controller
                        .remove(&task, ActivityStatus::Success, Some(&result), None)
                        .await
                }
                Err(e) => {
                    record_state_transition(&span, "in_progress", "failed");
                    error!(task_id = %task.id, error = %e, "task failed");
                    self.controller
                        .remove(&task, ActivityStatus::Failed, None, Some(&e))
                        .await
                }
            };

            match removed {
                Ok(()) => Ok(true),
                // Canceled or cleared while we were running it.
                Err(Error::NotFound(msg)) => {
                    warn!(task_id = %task.id, "outcome discarded: {msg}");
                    Ok(true)
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span.clone())
        .await
    }
}
