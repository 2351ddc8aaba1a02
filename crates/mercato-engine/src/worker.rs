//! Sync worker.
//!
//! Background worker that polls the task queue, executes tasks through a
//! [`TaskHandler`] with bounded concurrency, schedules retries with
//! exponential backoff, and maintains the queue (stale-claim release,
//! aged-record cleanup). Any number of worker processes may run against
//! the same queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mercato_db::{TaskRecord, WebhookEvent};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::{notify, Alert, AlertSink};
use crate::queue::{retry_delay, DEFAULT_RETRY_BASE_SECS, DEFAULT_RETRY_CAP_SECS};
use mercato_core::TaskId;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of tasks processed concurrently.
    pub concurrency: usize,

    /// Queue poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// How often to release stale claims, in seconds.
    pub stale_release_interval_secs: u64,

    /// Age after which a `started` claim counts as stale, in seconds.
    pub stale_after_secs: i64,

    /// How often to clean up aged records, in seconds.
    pub cleanup_interval_secs: u64,

    /// Retention for terminal task records, in days.
    pub task_retention_days: i64,

    /// Retention for completed webhook events, in days.
    pub webhook_retention_days: i64,

    /// Maximum tasks claimed per poll.
    pub batch_size: i64,

    /// Retry backoff base, in seconds.
    pub retry_base_secs: u64,

    /// Retry backoff cap, in seconds.
    pub retry_cap_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            stale_release_interval_secs: 300,
            stale_after_secs: 600,
            cleanup_interval_secs: 3600,
            task_retention_days: 30,
            webhook_retention_days: 30,
            batch_size: 10,
            retry_base_secs: DEFAULT_RETRY_BASE_SECS,
            retry_cap_secs: DEFAULT_RETRY_CAP_SECS,
        }
    }
}

/// Failure of one task execution.
#[derive(Debug, thiserror::Error)]
pub enum TaskRunError {
    /// Worth retrying (network, timeout, remote 5xx).
    #[error("{0}")]
    Retryable(String),

    /// Not worth retrying; the task fails terminally on first occurrence.
    #[error("{0}")]
    Terminal(String),
}

impl TaskRunError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskRunError::Retryable(_))
    }
}

/// Executes one claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task, returning a JSON result for the record.
    async fn handle(&self, task: &TaskRecord) -> Result<Value, TaskRunError>;
}

/// Polling worker over the shared task queue.
pub struct SyncWorker<H: TaskHandler> {
    pool: sqlx::PgPool,
    handler: Arc<H>,
    alerts: Arc<dyn AlertSink>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl<H: TaskHandler + 'static> SyncWorker<H> {
    pub fn new(
        pool: sqlx::PgPool,
        handler: Arc<H>,
        alerts: Arc<dyn AlertSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            handler,
            alerts,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for requesting shutdown from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting sync worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut stale_interval =
            interval(Duration::from_secs(self.config.stale_release_interval_secs));
        let mut cleanup_interval = interval(Duration::from_secs(self.config.cleanup_interval_secs));

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!("Worker shutdown requested, stopping poll loop");
                        break;
                    }
                    self.poll_and_process(&semaphore).await;
                }
                _ = stale_interval.tick() => {
                    self.release_stale_claims().await;
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_aged_records().await;
                }
            }
        }

        // Wait for in-flight tasks to complete.
        info!("Waiting for in-flight tasks to complete...");
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("Worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn poll_and_process(&self, semaphore: &Arc<Semaphore>) {
        // Claim no more rows than there are free slots; claiming and
        // bouncing a task back would burn one of its attempts.
        let batch = self
            .config
            .batch_size
            .min(semaphore.available_permits() as i64);
        if batch == 0 {
            return;
        }

        let tasks = match TaskRecord::dequeue_batch(&self.pool, batch).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to dequeue tasks");
                return;
            }
        };

        if tasks.is_empty() {
            return;
        }
        debug!(count = tasks.len(), "Dequeued tasks for processing");

        for task in tasks {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("All worker slots busy, requeueing remaining tasks");
                // Claimed but unprocessed rows go back to runnable so
                // another worker can pick them up right away.
                if let Err(e) = TaskRecord::mark_retry(
                    &self.pool,
                    TaskId::from_uuid(task.task_id),
                    "requeued: worker at capacity",
                    Utc::now(),
                )
                .await
                {
                    error!(error = %e, "Failed to requeue task");
                }
                continue;
            };

            let pool = self.pool.clone();
            let handler = self.handler.clone();
            let alerts = self.alerts.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                let _permit = permit; // Hold until the task completes.
                process_task(pool, handler, alerts, config, task).await;
            });
        }
    }

    async fn release_stale_claims(&self) {
        match TaskRecord::release_stale(&self.pool, self.config.stale_after_secs).await {
            Ok(count) if count > 0 => {
                warn!(count = count, "Released stale task claims");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to release stale claims");
            }
        }
    }

    async fn cleanup_aged_records(&self) {
        match TaskRecord::delete_older_than(&self.pool, self.config.task_retention_days).await {
            Ok(count) if count > 0 => {
                info!(count = count, "Cleaned up old task records");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to clean up task records");
            }
        }

        match WebhookEvent::delete_completed_older_than(
            &self.pool,
            self.config.webhook_retention_days,
        )
        .await
        {
            Ok(count) if count > 0 => {
                info!(count = count, "Cleaned up old webhook events");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to clean up webhook events");
            }
        }
    }
}

/// Execute one claimed task and record its outcome.
#[instrument(skip(pool, handler, alerts, config, task), fields(task_id = %task.task_id, task_name = %task.task_name))]
async fn process_task<H: TaskHandler>(
    pool: sqlx::PgPool,
    handler: Arc<H>,
    alerts: Arc<dyn AlertSink>,
    config: WorkerConfig,
    task: TaskRecord,
) {
    let task_id = TaskId::from_uuid(task.task_id);
    let start = std::time::Instant::now();

    info!(attempt = task.attempt, "Processing task");
    let result = handler.handle(&task).await;
    let duration_ms = start.elapsed().as_millis() as i64;

    match result {
        Ok(value) => {
            info!(duration_ms = duration_ms, "Task completed");
            if let Err(e) = TaskRecord::mark_success(&pool, task_id, Some(&value)).await {
                error!(error = %e, "Failed to mark task success");
            }
            finalize_parent(&pool, &task).await;
        }
        Err(run_error) => {
            let message = run_error.to_string();
            let will_retry = run_error.is_retryable() && task.attempt < task.max_attempts;

            if will_retry {
                let delay = retry_delay(task.attempt, config.retry_base_secs, config.retry_cap_secs);
                warn!(
                    duration_ms = duration_ms,
                    error = %message,
                    attempt = task.attempt,
                    max_attempts = task.max_attempts,
                    delay_secs = delay.as_secs(),
                    "Task failed, retry scheduled"
                );
                let next_run =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                if let Err(e) = TaskRecord::mark_retry(&pool, task_id, &message, next_run).await {
                    error!(error = %e, "Failed to schedule retry");
                }
            } else {
                error!(
                    duration_ms = duration_ms,
                    error = %message,
                    attempt = task.attempt,
                    "Task failed permanently"
                );
                if let Err(e) = TaskRecord::mark_failure(&pool, task_id, &message).await {
                    error!(error = %e, "Failed to mark task failure");
                }
                notify(
                    &alerts,
                    Alert::task_failure(
                        &task.task_name,
                        &message,
                        task.tenant_id,
                        task.attempt,
                        task.max_attempts,
                    ),
                );
                finalize_parent(&pool, &task).await;
            }
        }
    }
}

/// Recompute the parent's derived status after a child reached a
/// terminal state.
async fn finalize_parent(pool: &sqlx::PgPool, task: &TaskRecord) {
    let Some(parent_id) = task.parent_task_id else {
        return;
    };
    match TaskRecord::recompute_parent(pool, TaskId::from_uuid(parent_id)).await {
        Ok(Some(status)) => {
            debug!(parent_task_id = %parent_id, status = %status, "Parent status derived");
        }
        Ok(None) => {}
        Err(e) => {
            error!(parent_task_id = %parent_id, error = %e, "Failed to recompute parent status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retry_base_secs, 60);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TaskRunError::Retryable("timeout".into()).is_retryable());
        assert!(!TaskRunError::Terminal("bad payload".into()).is_retryable());
    }
}
