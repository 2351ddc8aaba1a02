//! Sync record model.
//!
//! One table per entity kind, all of identical shape, mapping a source
//! identity to at most one sink identity per tenant. Two invariants are
//! enforced by unique indexes and defended again in application code:
//!
//! - `(source_id, tenant_id)` is unique per table
//! - `(sink_id, tenant_id)` is unique per table
//!
//! Records are created on the first reconciliation attempt, updated on
//! every subsequent attempt, and never deleted automatically — they are
//! the audit trail that makes replayed work idempotent.

use chrono::{DateTime, Utc};
use mercato_core::EntityKind;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Identity mapping row for one source entity within one tenant.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: Uuid,

    /// Entity id in the source system.
    pub source_id: i64,

    /// Entity id in the sink system, once resolved.
    pub sink_id: Option<i64>,

    /// Owning tenant.
    pub tenant_id: Uuid,

    /// Last known entity name, for display.
    pub name: Option<String>,

    /// Outcome flags of the last reconciliation attempt.
    pub created: bool,
    pub updated: bool,
    pub skipped: bool,
    pub error: bool,

    /// Marked by change detection; cleared on successful sync.
    pub needs_sync: bool,

    /// Human-readable outcome of the last attempt.
    pub message: Option<String>,

    /// Detail string for error outcomes.
    pub error_details: Option<String>,

    /// The source system's write timestamp at the last sync.
    pub source_write_date: Option<DateTime<Utc>>,

    /// When the entity was last successfully reconciled.
    pub last_synced_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one reconciliation attempt, applied via
/// [`SyncRecord::upsert_result`].
#[derive(Debug, Clone, Default)]
pub struct SyncRecordResult {
    pub sink_id: Option<i64>,
    pub name: Option<String>,
    pub created: bool,
    pub updated: bool,
    pub skipped: bool,
    pub message: Option<String>,
    pub source_write_date: Option<DateTime<Utc>>,
}

/// Per-status counters over one tenant's records.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncCounts {
    pub total: i64,
    pub synced: i64,
    pub errors: i64,
    pub needs_sync: i64,
}

impl SyncRecord {
    /// Find a record by source id.
    pub async fn find_by_source_id(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        let sql = format!(
            "SELECT * FROM {} WHERE tenant_id = $1 AND source_id = $2",
            kind.sync_table()
        );
        sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(source_id)
            .fetch_optional(pool)
            .await
    }

    /// Find a record by sink id.
    ///
    /// This is the conflict probe: before any write the reconciler asks
    /// whether a candidate sink id is already claimed by a different
    /// source id within the tenant.
    pub async fn find_by_sink_id(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
        sink_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        let sql = format!(
            "SELECT * FROM {} WHERE tenant_id = $1 AND sink_id = $2",
            kind.sync_table()
        );
        sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(sink_id)
            .fetch_optional(pool)
            .await
    }

    /// Record a successful (or skipped) reconciliation attempt.
    ///
    /// Creates the record on first contact and updates it on every later
    /// attempt. A successful attempt stamps `last_synced_at`, clears
    /// `needs_sync` and clears any prior error state.
    pub async fn upsert_result(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        result: &SyncRecordResult,
    ) -> Result<Self, sqlx::Error> {
        let sql = format!(
            r"
            INSERT INTO {} (
                id, tenant_id, source_id, sink_id, name, created, updated,
                skipped, error, needs_sync, message, error_details,
                source_write_date, last_synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, false, $9, NULL, $10, NOW())
            ON CONFLICT (tenant_id, source_id) DO UPDATE SET
                sink_id = EXCLUDED.sink_id,
                name = COALESCE(EXCLUDED.name, {table}.name),
                created = EXCLUDED.created,
                updated = EXCLUDED.updated,
                skipped = EXCLUDED.skipped,
                error = false,
                needs_sync = false,
                message = EXCLUDED.message,
                error_details = NULL,
                source_write_date = COALESCE(EXCLUDED.source_write_date, {table}.source_write_date),
                last_synced_at = NOW(),
                updated_at = NOW()
            RETURNING *
            ",
            kind.sync_table(),
            table = kind.sync_table(),
        );
        sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(source_id)
            .bind(result.sink_id)
            .bind(&result.name)
            .bind(result.created)
            .bind(result.updated)
            .bind(result.skipped)
            .bind(&result.message)
            .bind(result.source_write_date)
            .fetch_one(pool)
            .await
    }

    /// Record a failed reconciliation attempt.
    ///
    /// Does not touch `sink_id` or `last_synced_at`: a failure must not
    /// erase a previously resolved identity mapping.
    pub async fn mark_error(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        name: Option<&str>,
        message: &str,
        details: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        let sql = format!(
            r"
            INSERT INTO {} (
                id, tenant_id, source_id, name, created, updated, skipped,
                error, needs_sync, message, error_details
            )
            VALUES ($1, $2, $3, $4, false, false, false, true, false, $5, $6)
            ON CONFLICT (tenant_id, source_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, {table}.name),
                created = false,
                updated = false,
                skipped = false,
                error = true,
                message = EXCLUDED.message,
                error_details = EXCLUDED.error_details,
                updated_at = NOW()
            RETURNING *
            ",
            kind.sync_table(),
            table = kind.sync_table(),
        );
        sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(source_id)
            .bind(name)
            .bind(message)
            .bind(details)
            .fetch_one(pool)
            .await
    }

    /// Bulk-mark records as needing sync. Returns the number updated.
    pub async fn mark_needing_sync(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
        source_ids: &[i64],
    ) -> Result<u64, sqlx::Error> {
        let sql = format!(
            "UPDATE {} SET needs_sync = true, updated_at = NOW()
             WHERE tenant_id = $1 AND source_id = ANY($2)",
            kind.sync_table()
        );
        let result = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(source_ids)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// List records marked as needing sync.
    pub async fn list_needing_sync(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let sql = format!(
            "SELECT * FROM {} WHERE tenant_id = $1 AND needs_sync = true
             ORDER BY updated_at ASC LIMIT $2",
            kind.sync_table()
        );
        sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Summary counters for one tenant.
    pub async fn counts(
        pool: &sqlx::PgPool,
        kind: EntityKind,
        tenant_id: Uuid,
    ) -> Result<SyncCounts, sqlx::Error> {
        let sql = format!(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE last_synced_at IS NOT NULL AND NOT error) AS synced,
                COUNT(*) FILTER (WHERE error) AS errors,
                COUNT(*) FILTER (WHERE needs_sync) AS needs_sync
            FROM {}
            WHERE tenant_id = $1
            ",
            kind.sync_table()
        );
        let row: (i64, i64, i64, i64) = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_one(pool)
            .await?;
        Ok(SyncCounts {
            total: row.0,
            synced: row.1,
            errors: row.2,
            needs_sync: row.3,
        })
    }
}
