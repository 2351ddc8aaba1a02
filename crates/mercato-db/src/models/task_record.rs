//! Task record model.
//!
//! Task records form the execution tree for async work (via
//! `parent_task_id`) and double as the work queue: runnable rows are
//! claimed with `FOR UPDATE SKIP LOCKED` so any number of workers can
//! pull from the same table without double-claiming.
//!
//! Status transitions are monotonic:
//! `pending → started → {retry → started}* → {success | failure | revoked}`.
//! Terminal states never regress, and a parent's terminal status is only
//! ever derived from its children once children exist.

use chrono::{DateTime, Utc};
use mercato_core::TaskId;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Status of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    /// Whether this status is terminal (never regresses).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Started => write!(f, "started"),
            TaskStatus::Retry => write!(f, "retry"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failure => write!(f, "failure"),
            TaskStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// One task execution record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,

    /// Queue-native execution id. Redelivery reuses this id.
    pub task_id: Uuid,

    /// Parent task, when this task was fanned out by another.
    pub parent_task_id: Option<Uuid>,

    /// Logical task name (e.g. `sync_product`).
    pub task_name: String,

    pub tenant_id: Option<Uuid>,

    /// Serialized task arguments.
    pub args: serde_json::Value,

    pub status: TaskStatus,

    /// Number of attempts made so far.
    pub attempt: i32,

    /// Attempt cap; reaching it turns a retry into a terminal failure.
    pub max_attempts: i32,

    /// Earliest time the task may (re)run.
    pub next_run_at: DateTime<Utc>,

    /// When a worker claimed the row; used to release stale claims.
    pub locked_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to enqueue a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: TaskId,
    pub parent_task_id: Option<TaskId>,
    pub task_name: String,
    pub tenant_id: Option<Uuid>,
    pub args: serde_json::Value,
    pub max_attempts: i32,
    pub run_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Enqueue a task.
    ///
    /// Re-invocation with the same `task_id` (framework-level redelivery)
    /// flips the existing record to `retry` and makes it runnable again
    /// instead of creating a duplicate — unless the record is already
    /// terminal, in which case it is left untouched.
    pub async fn enqueue(pool: &sqlx::PgPool, input: &NewTask) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO task_records (
                id, task_id, parent_task_id, task_name, tenant_id, args,
                status, attempt, max_attempts, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, COALESCE($8, NOW()))
            ON CONFLICT (task_id) DO UPDATE SET
                status = CASE
                    WHEN task_records.status IN ('success', 'failure', 'revoked')
                        THEN task_records.status
                    ELSE 'retry'
                END,
                next_run_at = CASE
                    WHEN task_records.status IN ('success', 'failure', 'revoked')
                        THEN task_records.next_run_at
                    ELSE COALESCE($8, NOW())
                END,
                locked_at = NULL
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.task_id.into_uuid())
        .bind(input.parent_task_id.map(TaskId::into_uuid))
        .bind(&input.task_name)
        .bind(input.tenant_id)
        .bind(&input.args)
        .bind(input.max_attempts)
        .bind(input.run_at)
        .fetch_one(pool)
        .await
    }

    /// Claim a batch of runnable tasks.
    ///
    /// `FOR UPDATE SKIP LOCKED` lets concurrent workers dequeue from the
    /// same table without blocking each other or double-claiming rows.
    /// Claimed rows move to `started` with `attempt` incremented.
    pub async fn dequeue_batch(
        pool: &sqlx::PgPool,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE task_records
            SET status = 'started',
                attempt = attempt + 1,
                started_at = COALESCE(started_at, NOW()),
                locked_at = NOW()
            WHERE id IN (
                SELECT id FROM task_records
                WHERE status IN ('pending', 'retry')
                  AND next_run_at <= NOW()
                ORDER BY next_run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            ",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Mark a task as succeeded. No-op when already terminal.
    pub async fn mark_success(
        pool: &sqlx::PgPool,
        task_id: TaskId,
        result: Option<&serde_json::Value>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE task_records
            SET status = 'success',
                result = $2,
                error_message = NULL,
                locked_at = NULL,
                completed_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure', 'revoked')
            RETURNING *
            ",
        )
        .bind(task_id.into_uuid())
        .bind(result)
        .fetch_optional(pool)
        .await
    }

    /// Schedule a retry after a failed attempt.
    pub async fn mark_retry(
        pool: &sqlx::PgPool,
        task_id: TaskId,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE task_records
            SET status = 'retry',
                error_message = $2,
                next_run_at = $3,
                locked_at = NULL
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure', 'revoked')
            RETURNING *
            ",
        )
        .bind(task_id.into_uuid())
        .bind(error)
        .bind(next_run_at)
        .fetch_optional(pool)
        .await
    }

    /// Mark a task as terminally failed. No-op when already terminal.
    pub async fn mark_failure(
        pool: &sqlx::PgPool,
        task_id: TaskId,
        error: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE task_records
            SET status = 'failure',
                error_message = $2,
                locked_at = NULL,
                completed_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure', 'revoked')
            RETURNING *
            ",
        )
        .bind(task_id.into_uuid())
        .bind(error)
        .fetch_optional(pool)
        .await
    }

    /// Revoke a task.
    ///
    /// Advisory: a task mid-flight is not interrupted, but its terminal
    /// status is forced to `revoked` and no further retries run.
    pub async fn revoke(
        pool: &sqlx::PgPool,
        task_id: TaskId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE task_records
            SET status = 'revoked',
                locked_at = NULL,
                completed_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure')
            RETURNING *
            ",
        )
        .bind(task_id.into_uuid())
        .fetch_optional(pool)
        .await
    }

    /// Release rows claimed by workers that died mid-flight.
    ///
    /// A `started` row whose claim is older than `stale_after_secs` goes
    /// back to `retry` and becomes runnable immediately.
    pub async fn release_stale(
        pool: &sqlx::PgPool,
        stale_after_secs: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE task_records
            SET status = 'retry', locked_at = NULL, next_run_at = NOW()
            WHERE status = 'started'
              AND locked_at < NOW() - ($1 * INTERVAL '1 second')
            ",
        )
        .bind(stale_after_secs)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Recompute a parent's status from its children.
    ///
    /// The parent becomes `success` only when every child that exists has
    /// reached `success`; once any child is terminally `failure` (or
    /// `revoked`) and all children are terminal, the parent is `failure`.
    /// While any child is still running, the parent is left alone.
    pub async fn recompute_parent(
        pool: &sqlx::PgPool,
        parent_task_id: TaskId,
    ) -> Result<Option<TaskStatus>, sqlx::Error> {
        let children: Vec<(TaskStatus,)> = sqlx::query_as(
            r"
            SELECT status FROM task_records
            WHERE parent_task_id = $1
            ",
        )
        .bind(parent_task_id.into_uuid())
        .fetch_all(pool)
        .await?;

        if children.is_empty() {
            return Ok(None);
        }
        if children.iter().any(|(s,)| !s.is_terminal()) {
            return Ok(None);
        }

        let derived = if children.iter().all(|(s,)| *s == TaskStatus::Success) {
            TaskStatus::Success
        } else {
            TaskStatus::Failure
        };

        // A revoked parent stays revoked; otherwise the derived status
        // wins once every child is terminal.
        sqlx::query(
            r"
            UPDATE task_records
            SET status = $2, completed_at = COALESCE(completed_at, NOW())
            WHERE task_id = $1
              AND status != 'revoked'
            ",
        )
        .bind(parent_task_id.into_uuid())
        .bind(derived)
        .execute(pool)
        .await?;

        Ok(Some(derived))
    }

    /// Find a task by its execution id.
    pub async fn find_by_task_id(
        pool: &sqlx::PgPool,
        task_id: TaskId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM task_records
            WHERE task_id = $1
            ",
        )
        .bind(task_id.into_uuid())
        .fetch_optional(pool)
        .await
    }

    /// List direct children of a task.
    pub async fn find_children(
        pool: &sqlx::PgPool,
        parent_task_id: TaskId,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM task_records
            WHERE parent_task_id = $1
            ORDER BY created_at ASC
            ",
        )
        .bind(parent_task_id.into_uuid())
        .fetch_all(pool)
        .await
    }

    /// Delete terminal records older than the given age.
    pub async fn delete_older_than(pool: &sqlx::PgPool, days: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM task_records
            WHERE status IN ('success', 'failure', 'revoked')
              AND created_at < NOW() - ($1 * INTERVAL '1 day')
            ",
        )
        .bind(days)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Wall-clock duration, when the task has started.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(TaskStatus::Revoked.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn test_duration_requires_start() {
        let record = TaskRecord {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            parent_task_id: None,
            task_name: "sync_product".to_string(),
            tenant_id: None,
            args: serde_json::json!({}),
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: 3,
            next_run_at: Utc::now(),
            locked_at: None,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(record.duration_ms().is_none());
    }
}
