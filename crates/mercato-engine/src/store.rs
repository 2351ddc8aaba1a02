//! Sync record store seam.
//!
//! The reconciler talks to the identity-mapping tables through this
//! trait so the Postgres store and the in-memory store used by tests are
//! interchangeable. The store performs no row-level locking of its own:
//! the check-then-write sequence in the reconciler is only correct under
//! the entity's distributed lease.

use async_trait::async_trait;
use chrono::Utc;
use mercato_core::EntityKind;
use mercato_db::{SyncRecord, SyncRecordResult};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors from the sync record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Identity-mapping store for one-or-more entity kinds.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Look up the record for a source entity.
    async fn find_by_source_id(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
    ) -> Result<Option<SyncRecord>, StoreError>;

    /// Look up the record claiming a sink identity (conflict probe).
    async fn find_by_sink_id(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        sink_id: i64,
    ) -> Result<Option<SyncRecord>, StoreError>;

    /// Record a successful or skipped reconciliation attempt.
    async fn upsert_result(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        result: &SyncRecordResult,
    ) -> Result<SyncRecord, StoreError>;

    /// Record a failed reconciliation attempt.
    async fn mark_error(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        name: Option<&str>,
        message: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

/// Store over the per-kind Postgres tables.
#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: sqlx::PgPool,
}

impl PgSyncStore {
    #[must_use]
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn find_by_source_id(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
    ) -> Result<Option<SyncRecord>, StoreError> {
        Ok(SyncRecord::find_by_source_id(&self.pool, kind, tenant_id, source_id).await?)
    }

    async fn find_by_sink_id(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        sink_id: i64,
    ) -> Result<Option<SyncRecord>, StoreError> {
        Ok(SyncRecord::find_by_sink_id(&self.pool, kind, tenant_id, sink_id).await?)
    }

    async fn upsert_result(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        result: &SyncRecordResult,
    ) -> Result<SyncRecord, StoreError> {
        Ok(SyncRecord::upsert_result(&self.pool, kind, tenant_id, source_id, result).await?)
    }

    async fn mark_error(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        name: Option<&str>,
        message: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        SyncRecord::mark_error(&self.pool, kind, tenant_id, source_id, name, message, details)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory store for tests and examples.
#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    records: Mutex<HashMap<(EntityKind, Uuid, i64), SyncRecord>>,
}

impl InMemorySyncStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, across all kinds and tenants.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn blank_record(tenant_id: Uuid, source_id: i64) -> SyncRecord {
        let now = Utc::now();
        SyncRecord {
            id: Uuid::new_v4(),
            source_id,
            sink_id: None,
            tenant_id,
            name: None,
            created: false,
            updated: false,
            skipped: false,
            error: false,
            needs_sync: false,
            message: None,
            error_details: None,
            source_write_date: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn find_by_source_id(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
    ) -> Result<Option<SyncRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.get(&(kind, tenant_id, source_id)).cloned())
    }

    async fn find_by_sink_id(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        sink_id: i64,
    ) -> Result<Option<SyncRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .find(|((k, t, _), r)| *k == kind && *t == tenant_id && r.sink_id == Some(sink_id))
            .map(|(_, r)| r.clone()))
    }

    async fn upsert_result(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        result: &SyncRecordResult,
    ) -> Result<SyncRecord, StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry((kind, tenant_id, source_id))
            .or_insert_with(|| Self::blank_record(tenant_id, source_id));

        record.sink_id = result.sink_id;
        if result.name.is_some() {
            record.name = result.name.clone();
        }
        record.created = result.created;
        record.updated = result.updated;
        record.skipped = result.skipped;
        record.error = false;
        record.needs_sync = false;
        record.message = result.message.clone();
        record.error_details = None;
        if result.source_write_date.is_some() {
            record.source_write_date = result.source_write_date;
        }
        record.last_synced_at = Some(Utc::now());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn mark_error(
        &self,
        kind: EntityKind,
        tenant_id: Uuid,
        source_id: i64,
        name: Option<&str>,
        message: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry((kind, tenant_id, source_id))
            .or_insert_with(|| Self::blank_record(tenant_id, source_id));

        if let Some(name) = name {
            record.name = Some(name.to_string());
        }
        record.created = false;
        record.updated = false;
        record.skipped = false;
        record.error = true;
        record.message = Some(message.to_string());
        record.error_details = details.map(ToString::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_then_find() {
        let store = InMemorySyncStore::new();
        let tenant = Uuid::new_v4();

        let result = SyncRecordResult {
            sink_id: Some(100),
            name: Some("Desk".to_string()),
            created: true,
            ..Default::default()
        };
        store
            .upsert_result(EntityKind::Product, tenant, 1, &result)
            .await
            .unwrap();

        let by_source = store
            .find_by_source_id(EntityKind::Product, tenant, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_source.sink_id, Some(100));
        assert!(by_source.created);
        assert!(by_source.last_synced_at.is_some());

        let by_sink = store
            .find_by_sink_id(EntityKind::Product, tenant, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_sink.source_id, 1);
    }

    #[tokio::test]
    async fn test_success_clears_error() {
        let store = InMemorySyncStore::new();
        let tenant = Uuid::new_v4();

        store
            .mark_error(EntityKind::Tag, tenant, 5, None, "boom", Some("detail"))
            .await
            .unwrap();
        let record = store
            .find_by_source_id(EntityKind::Tag, tenant, 5)
            .await
            .unwrap()
            .unwrap();
        assert!(record.error);

        let result = SyncRecordResult {
            sink_id: Some(7),
            updated: true,
            ..Default::default()
        };
        store
            .upsert_result(EntityKind::Tag, tenant, 5, &result)
            .await
            .unwrap();
        let record = store
            .find_by_source_id(EntityKind::Tag, tenant, 5)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.error);
        assert!(record.error_details.is_none());
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let store = InMemorySyncStore::new();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        let result = SyncRecordResult {
            sink_id: Some(100),
            created: true,
            ..Default::default()
        };
        store
            .upsert_result(EntityKind::Product, tenant_a, 1, &result)
            .await
            .unwrap();

        assert!(store
            .find_by_source_id(EntityKind::Product, tenant_b, 1)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_by_sink_id(EntityKind::Product, tenant_b, 100)
            .await
            .unwrap()
            .is_none());
    }
}
