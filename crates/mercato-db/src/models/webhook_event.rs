//! Webhook event log.
//!
//! Every accepted inbound delivery is recorded here. `event_id` is the
//! delivery's natural idempotency key; `payload_hash` is a secondary
//! dedup signal for retried deliveries that change the delivery id.
//! Records are retained for audit and cleaned up by age.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Processing state of a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookStatus::Pending => write!(f, "pending"),
            WebhookStatus::Processing => write!(f, "processing"),
            WebhookStatus::Completed => write!(f, "completed"),
            WebhookStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded webhook delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub payload_hash: String,
    pub event_type: String,
    pub tenant_id: Uuid,
    pub payload: serde_json::Value,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// Find a delivery by its event id.
    pub async fn find_by_event_id(
        pool: &sqlx::PgPool,
        event_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_events
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_optional(pool)
        .await
    }

    /// Find a recent delivery with the same payload hash.
    ///
    /// Only a bounded window is consulted: the hash dedups retried
    /// deliveries that were re-issued under a new delivery id, not
    /// identical payloads arriving days apart.
    pub async fn find_recent_by_payload_hash(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
        payload_hash: &str,
        window_hours: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_events
            WHERE tenant_id = $1
              AND payload_hash = $2
              AND received_at > NOW() - ($3 * INTERVAL '1 hour')
            ORDER BY received_at DESC
            LIMIT 1
            ",
        )
        .bind(tenant_id)
        .bind(payload_hash)
        .bind(window_hours)
        .fetch_optional(pool)
        .await
    }

    /// Record a newly accepted delivery in `processing` state.
    pub async fn create_processing(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
        event_id: &str,
        event_type: &str,
        payload_hash: &str,
        payload: &serde_json::Value,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO webhook_events (
                id, event_id, payload_hash, event_type, tenant_id, payload,
                status, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'processing', 0)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(payload_hash)
        .bind(event_type)
        .bind(tenant_id)
        .bind(payload)
        .fetch_one(pool)
        .await
    }

    /// Advance an existing delivery back into `processing` for a retry.
    pub async fn begin_processing(
        pool: &sqlx::PgPool,
        event_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE webhook_events
            SET status = 'processing', retry_count = retry_count + 1
            WHERE event_id = $1
            RETURNING *
            ",
        )
        .bind(event_id)
        .fetch_optional(pool)
        .await
    }

    /// Mark a delivery as completed.
    pub async fn complete(pool: &sqlx::PgPool, event_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'completed', error_message = NULL, processed_at = NOW()
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Mark a delivery as failed with an error message.
    pub async fn fail(
        pool: &sqlx::PgPool,
        event_id: &str,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'failed', error_message = $2, processed_at = NOW()
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Delete completed deliveries older than the given age.
    pub async fn delete_completed_older_than(
        pool: &sqlx::PgPool,
        days: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM webhook_events
            WHERE status = 'completed'
              AND received_at < NOW() - ($1 * INTERVAL '1 day')
            ",
        )
        .bind(days)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
