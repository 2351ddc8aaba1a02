//! Task dispatcher.
//!
//! Thin layer over the task-record queue: naming, argument encoding,
//! enqueue (including chains and child tasks) and the retry schedule.
//! The queue itself is the `task_records` table; delivery is
//! at-least-once and every task's effects are idempotent.

use chrono::{DateTime, Utc};
use mercato_core::TaskId;
use mercato_db::{NewTask, TaskRecord};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Default retry schedule: 60s, 120s, 240s, … capped at one hour.
pub const DEFAULT_RETRY_BASE_SECS: u64 = 60;
pub const DEFAULT_RETRY_CAP_SECS: u64 = 3600;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// The kinds of async work the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Reconcile one product into the sink.
    SyncProduct,
    /// Reconcile a category chain, one link at a time.
    SyncCategoryChain,
    /// Reconcile one tag into the sink.
    SyncTag,
    /// Reconcile one attribute (and then its values) into the sink.
    SyncAttribute,
    /// Reconcile one attribute value into the sink.
    SyncAttributeValue,
    /// Recompute and push price fields for one product.
    SyncProductPrices,
    /// Process one accepted webhook event.
    ProcessWebhook,
    /// Paginate the source catalog and fan out per-product syncs.
    FullProductSync,
}

impl TaskKind {
    /// Stable task name stored on the record.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskKind::SyncProduct => "sync_product",
            TaskKind::SyncCategoryChain => "sync_category_chain",
            TaskKind::SyncTag => "sync_tag",
            TaskKind::SyncAttribute => "sync_attribute",
            TaskKind::SyncAttributeValue => "sync_attribute_value",
            TaskKind::SyncProductPrices => "sync_product_prices",
            TaskKind::ProcessWebhook => "process_webhook",
            TaskKind::FullProductSync => "full_product_sync",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync_product" => Ok(TaskKind::SyncProduct),
            "sync_category_chain" => Ok(TaskKind::SyncCategoryChain),
            "sync_tag" => Ok(TaskKind::SyncTag),
            "sync_attribute" => Ok(TaskKind::SyncAttribute),
            "sync_attribute_value" => Ok(TaskKind::SyncAttributeValue),
            "sync_product_prices" => Ok(TaskKind::SyncProductPrices),
            "process_webhook" => Ok(TaskKind::ProcessWebhook),
            "full_product_sync" => Ok(TaskKind::FullProductSync),
            _ => Err(format!("Unknown task kind: {s}")),
        }
    }
}

/// Errors from dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Submits work to the queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: sqlx::PgPool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a task, returning its execution id.
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        tenant_id: Option<Uuid>,
        args: Value,
        parent: Option<TaskId>,
    ) -> Result<TaskId, DispatchError> {
        self.enqueue_at(kind, tenant_id, args, parent, None).await
    }

    /// Enqueue a task to run no earlier than `run_at`.
    pub async fn enqueue_at(
        &self,
        kind: TaskKind,
        tenant_id: Option<Uuid>,
        args: Value,
        parent: Option<TaskId>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, DispatchError> {
        let task_id = TaskId::new();
        TaskRecord::enqueue(
            &self.pool,
            &NewTask {
                task_id,
                parent_task_id: parent,
                task_name: kind.as_str().to_string(),
                tenant_id,
                args,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                run_at,
            },
        )
        .await?;

        info!(
            task_id = %task_id,
            kind = %kind,
            parent = ?parent.map(|p| p.to_string()),
            "Task enqueued"
        );
        Ok(task_id)
    }

    /// Revoke a task: advisory, forces the terminal status to `revoked`
    /// and stops further retries.
    pub async fn revoke(&self, task_id: TaskId) -> Result<bool, DispatchError> {
        Ok(TaskRecord::revoke(&self.pool, task_id).await?.is_some())
    }

    #[must_use]
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
///
/// `attempt` counts completed attempts, so the first retry (after
/// attempt 1) waits `base * 2`.
#[must_use]
pub fn retry_delay(attempt: i32, base_secs: u64, cap_secs: u64) -> Duration {
    let exponent = attempt.clamp(0, 32) as u32;
    let delay = base_secs.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_secs(delay.min(cap_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            TaskKind::SyncProduct,
            TaskKind::SyncCategoryChain,
            TaskKind::SyncTag,
            TaskKind::SyncAttribute,
            TaskKind::SyncAttributeValue,
            TaskKind::SyncProductPrices,
            TaskKind::ProcessWebhook,
            TaskKind::FullProductSync,
        ] {
            let parsed: TaskKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(0, 60, 3600), Duration::from_secs(60));
        assert_eq!(retry_delay(1, 60, 3600), Duration::from_secs(120));
        assert_eq!(retry_delay(2, 60, 3600), Duration::from_secs(240));
        assert_eq!(retry_delay(3, 60, 3600), Duration::from_secs(480));
    }

    #[test]
    fn test_retry_delay_caps() {
        assert_eq!(retry_delay(10, 60, 3600), Duration::from_secs(3600));
        assert_eq!(retry_delay(63, 60, 3600), Duration::from_secs(3600));
    }

    #[test]
    fn test_retry_delay_negative_attempt_clamped() {
        assert_eq!(retry_delay(-1, 60, 3600), Duration::from_secs(60));
    }
}
