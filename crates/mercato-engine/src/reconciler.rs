//! Generic entity reconciler.
//!
//! One create-or-update-or-skip algorithm shared by every entity kind.
//! The per-kind differences (how to fetch, search, create, update in the
//! sink) live behind [`EntityAdapter`], a small capability record rather
//! than an inheritance hierarchy.
//!
//! The identity invariant defended here: within one tenant, a sink
//! identity belongs to at most one source identity. Before any write —
//! and again after a create, which can race a concurrent worker — the
//! candidate sink id is checked against the store, and a collision
//! aborts with an error outcome instead of silently remapping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::EntityKind;
use mercato_db::SyncRecordResult;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lock::{Lease, LockBroker, LockOptions};
use crate::store::{StoreError, SyncStore};
use mercato_connector::ConnectorError;

/// Errors that abort a reconciliation attempt entirely.
///
/// Only failures worth retrying at the task level surface here; anything
/// terminal for the entity is reported as a [`SyncAction::Error`]
/// outcome and recorded on the sync record instead.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Transient connector failure; the task layer retries with backoff.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Sync store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A normalized source entity handed to the reconciler.
#[derive(Debug, Clone)]
pub struct SourceEntity {
    /// Entity id in the source system.
    pub source_id: i64,
    /// Display name.
    pub name: String,
    /// Natural key for secondary sink resolution (SKU, slug, name).
    pub natural_key: Option<String>,
    /// The source system's write timestamp for this entity.
    pub write_date: Option<DateTime<Utc>>,
    /// Normalized source fields.
    pub data: Value,
}

/// Per-kind reconciliation capabilities.
#[async_trait]
pub trait EntityAdapter: Send + Sync {
    /// The entity kind this adapter serves.
    fn kind(&self) -> EntityKind;

    /// Fetch the sink document by its id. `Ok(None)` when the id is
    /// stale (the sink no longer has it).
    async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError>;

    /// Search the sink by the entity's natural key.
    async fn fetch_by_natural_key(
        &self,
        entity: &SourceEntity,
    ) -> Result<Option<Value>, ConnectorError>;

    /// Create the entity in the sink, returning the new document.
    async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError>;

    /// Update an existing sink entity, returning the updated document.
    async fn update(&self, sink_id: i64, entity: &SourceEntity)
        -> Result<Value, ConnectorError>;
}

/// What the reconciler is allowed to do.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub create_if_missing: bool,
    pub update_existing: bool,
    pub lock: LockOptions,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            update_existing: true,
            lock: LockOptions::default(),
        }
    }
}

/// The four possible outcomes of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Skipped,
    Error,
}

/// Outcome of one reconciliation, with a human-readable message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncOutcome {
    pub action: SyncAction,
    pub source_id: i64,
    pub sink_id: Option<i64>,
    pub message: String,
    pub error_details: Option<String>,
}

impl SyncOutcome {
    fn skipped(source_id: i64, message: impl Into<String>) -> Self {
        Self {
            action: SyncAction::Skipped,
            source_id,
            sink_id: None,
            message: message.into(),
            error_details: None,
        }
    }

    /// Whether the outcome is terminal-bad for this entity.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.action == SyncAction::Error
    }
}

/// Outcome counters aggregated across a batch.
///
/// Entity-level errors never abort sibling entities; callers fold every
/// outcome into a summary and report partial results.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SyncBatchSummary {
    pub total: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl SyncBatchSummary {
    pub fn record(&mut self, outcome: &SyncOutcome) {
        self.total += 1;
        match outcome.action {
            SyncAction::Created => self.created += 1,
            SyncAction::Updated => self.updated += 1,
            SyncAction::Skipped => self.skipped += 1,
            SyncAction::Error => self.errors += 1,
        }
    }
}

/// Reconcile one source entity against the sink.
///
/// Algorithm (identical for every kind):
/// 1. acquire the entity's distributed lease; on failure return
///    `skipped` — another worker will converge the same state;
/// 2. resolve the sink id from the sync record, falling back to a
///    natural-key search when the record is missing or stale;
/// 3. check the candidate sink id for an identity conflict;
/// 4. update or create (per options), re-checking for a conflict after
///    a create;
/// 5. upsert the sync record and always release the lease.
pub async fn reconcile_entity(
    store: &dyn SyncStore,
    broker: Option<&dyn LockBroker>,
    adapter: &dyn EntityAdapter,
    tenant_id: Uuid,
    entity: &SourceEntity,
    opts: &ReconcileOptions,
) -> Result<SyncOutcome, ReconcileError> {
    let kind = adapter.kind();
    let key = Lease::key_for(kind, entity.source_id, tenant_id);

    let lease = match broker {
        Some(broker) => match broker.acquire(&key, opts.lock).await {
            Some(lease) => Some(lease),
            None => {
                warn!(key = %key, "Could not acquire lock, skipping sync");
                return Ok(SyncOutcome::skipped(
                    entity.source_id,
                    "Another worker is syncing this entity",
                ));
            }
        },
        None => {
            warn!(key = %key, "No lock broker configured, running unprotected");
            None
        }
    };

    let result = reconcile_locked(store, adapter, tenant_id, entity, opts).await;

    if let (Some(broker), Some(lease)) = (broker, lease) {
        broker.release(lease).await;
    }

    result
}

async fn reconcile_locked(
    store: &dyn SyncStore,
    adapter: &dyn EntityAdapter,
    tenant_id: Uuid,
    entity: &SourceEntity,
    opts: &ReconcileOptions,
) -> Result<SyncOutcome, ReconcileError> {
    let kind = adapter.kind();

    // Resolve the candidate sink id: sync record first, then the
    // natural key as the secondary resolution path.
    let record = store
        .find_by_source_id(kind, tenant_id, entity.source_id)
        .await?;

    let mut sink_id: Option<i64> = None;
    if let Some(record_sink_id) = record.as_ref().and_then(|r| r.sink_id) {
        match adapter.fetch_by_id(record_sink_id).await {
            Ok(Some(_)) => sink_id = Some(record_sink_id),
            Ok(None) => {
                info!(
                    kind = %kind,
                    source_id = entity.source_id,
                    stale_sink_id = record_sink_id,
                    "Recorded sink id is stale, falling back to natural key"
                );
            }
            Err(e) if !e.is_retryable() => {
                info!(
                    kind = %kind,
                    source_id = entity.source_id,
                    error = %e,
                    "Sink lookup by id failed, falling back to natural key"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    if sink_id.is_none() {
        match adapter.fetch_by_natural_key(entity).await {
            Ok(Some(found)) => sink_id = found.get("id").and_then(Value::as_i64),
            Ok(None) => {}
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                info!(
                    kind = %kind,
                    source_id = entity.source_id,
                    error = %e,
                    "Natural-key search failed, treating entity as unresolved"
                );
            }
        }
    }

    // Conflict check, mandatory before any write.
    if let Some(candidate) = sink_id {
        if let Some(conflict) =
            find_conflict(store, kind, tenant_id, entity.source_id, candidate).await?
        {
            return record_conflict(store, kind, tenant_id, entity, candidate, conflict).await;
        }
    }

    let outcome = match sink_id {
        Some(sink_id) if opts.update_existing => {
            match adapter.update(sink_id, entity).await {
                Ok(doc) => {
                    let final_id = doc.get("id").and_then(Value::as_i64).unwrap_or(sink_id);
                    SyncOutcome {
                        action: SyncAction::Updated,
                        source_id: entity.source_id,
                        sink_id: Some(final_id),
                        message: format!("{} updated: {}", kind, entity.name),
                        error_details: None,
                    }
                }
                Err(e) if e.is_retryable() => return Err(e.into()),
                Err(terminal) => {
                    return record_failure(store, kind, tenant_id, entity, terminal).await
                }
            }
        }
        Some(sink_id) => SyncOutcome {
            action: SyncAction::Skipped,
            source_id: entity.source_id,
            sink_id: Some(sink_id),
            message: "Entity exists, update disabled".to_string(),
            error_details: None,
        },
        None if opts.create_if_missing => {
            match adapter.create(entity).await {
                Ok(doc) => {
                    let new_id = doc.get("id").and_then(Value::as_i64);
                    // Creation can race a concurrent worker: re-check the
                    // identity invariant against the newly created id.
                    if let Some(new_id) = new_id {
                        if let Some(conflict) =
                            find_conflict(store, kind, tenant_id, entity.source_id, new_id).await?
                        {
                            return record_conflict(
                                store, kind, tenant_id, entity, new_id, conflict,
                            )
                            .await;
                        }
                    }
                    SyncOutcome {
                        action: SyncAction::Created,
                        source_id: entity.source_id,
                        sink_id: new_id,
                        message: format!("{} created: {}", kind, entity.name),
                        error_details: None,
                    }
                }
                Err(e) if e.is_retryable() => return Err(e.into()),
                Err(terminal) => {
                    return record_failure(store, kind, tenant_id, entity, terminal).await
                }
            }
        }
        None => SyncOutcome {
            action: SyncAction::Skipped,
            source_id: entity.source_id,
            sink_id: None,
            message: "Entity doesn't exist, creation disabled".to_string(),
            error_details: None,
        },
    };

    let result = SyncRecordResult {
        sink_id: outcome.sink_id,
        name: Some(entity.name.clone()),
        created: outcome.action == SyncAction::Created,
        updated: outcome.action == SyncAction::Updated,
        skipped: outcome.action == SyncAction::Skipped,
        message: Some(outcome.message.clone()),
        source_write_date: entity.write_date,
    };
    store
        .upsert_result(kind, tenant_id, entity.source_id, &result)
        .await?;

    info!(
        kind = %kind,
        source_id = entity.source_id,
        sink_id = ?outcome.sink_id,
        action = ?outcome.action,
        "Reconciliation finished"
    );
    Ok(outcome)
}

/// Return the conflicting source id when `candidate` is already mapped
/// to a different source entity within the tenant.
async fn find_conflict(
    store: &dyn SyncStore,
    kind: EntityKind,
    tenant_id: Uuid,
    source_id: i64,
    candidate: i64,
) -> Result<Option<i64>, StoreError> {
    let existing = store.find_by_sink_id(kind, tenant_id, candidate).await?;
    Ok(existing
        .filter(|record| record.source_id != source_id)
        .map(|record| record.source_id))
}

async fn record_conflict(
    store: &dyn SyncStore,
    kind: EntityKind,
    tenant_id: Uuid,
    entity: &SourceEntity,
    sink_id: i64,
    other_source_id: i64,
) -> Result<SyncOutcome, ReconcileError> {
    let message = format!(
        "Sink {kind} {sink_id} already mapped to a different source entity ({other_source_id})"
    );
    warn!(
        kind = %kind,
        source_id = entity.source_id,
        sink_id = sink_id,
        other_source_id = other_source_id,
        "Identity conflict detected"
    );
    store
        .mark_error(
            kind,
            tenant_id,
            entity.source_id,
            Some(&entity.name),
            &message,
            Some("identity mapping conflict; manual intervention required"),
        )
        .await?;
    Ok(SyncOutcome {
        action: SyncAction::Error,
        source_id: entity.source_id,
        sink_id: None,
        message,
        error_details: Some("identity mapping conflict".to_string()),
    })
}

async fn record_failure(
    store: &dyn SyncStore,
    kind: EntityKind,
    tenant_id: Uuid,
    entity: &SourceEntity,
    error: ConnectorError,
) -> Result<SyncOutcome, ReconcileError> {
    let message = format!("Sink write failed: {error}");
    store
        .mark_error(
            kind,
            tenant_id,
            entity.source_id,
            Some(&entity.name),
            &message,
            Some(&error.to_string()),
        )
        .await?;
    Ok(SyncOutcome {
        action: SyncAction::Error,
        source_id: entity.source_id,
        sink_id: None,
        message,
        error_details: Some(error.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockBroker;
    use crate::store::InMemorySyncStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::Mutex;

    /// Scriptable in-memory sink for one entity kind.
    struct FakeAdapter {
        kind: EntityKind,
        docs: Mutex<HashMap<i64, Value>>,
        next_id: AtomicI64,
        fail_create: bool,
    }

    impl FakeAdapter {
        fn new(kind: EntityKind) -> Self {
            Self {
                kind,
                docs: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(100),
                fail_create: false,
            }
        }

        async fn seed(&self, id: i64, doc: Value) {
            self.docs.lock().await.insert(id, doc);
        }
    }

    #[async_trait]
    impl EntityAdapter for FakeAdapter {
        fn kind(&self) -> EntityKind {
            self.kind
        }

        async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError> {
            Ok(self.docs.lock().await.get(&sink_id).cloned())
        }

        async fn fetch_by_natural_key(
            &self,
            entity: &SourceEntity,
        ) -> Result<Option<Value>, ConnectorError> {
            let Some(key) = entity.natural_key.as_deref() else {
                return Ok(None);
            };
            Ok(self
                .docs
                .lock()
                .await
                .values()
                .find(|doc| doc.get("sku").and_then(Value::as_str) == Some(key))
                .cloned())
        }

        async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError> {
            if self.fail_create {
                return Err(ConnectorError::Validation {
                    message: "rejected by sink".to_string(),
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let doc = json!({
                "id": id,
                "name": entity.name,
                "sku": entity.natural_key,
            });
            self.docs.lock().await.insert(id, doc.clone());
            Ok(doc)
        }

        async fn update(
            &self,
            sink_id: i64,
            entity: &SourceEntity,
        ) -> Result<Value, ConnectorError> {
            let doc = json!({
                "id": sink_id,
                "name": entity.name,
                "sku": entity.natural_key,
            });
            self.docs.lock().await.insert(sink_id, doc.clone());
            Ok(doc)
        }
    }

    fn entity(source_id: i64, name: &str, sku: Option<&str>) -> SourceEntity {
        SourceEntity {
            source_id,
            name: name.to_string(),
            natural_key: sku.map(ToString::to_string),
            write_date: None,
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_creates_when_unresolved() {
        let store = InMemorySyncStore::new();
        let adapter = FakeAdapter::new(EntityKind::Product);
        let tenant = Uuid::new_v4();

        let outcome = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(1, "Desk", Some("DESK-1")),
            &ReconcileOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.action, SyncAction::Created);
        let record = store
            .find_by_source_id(EntityKind::Product, tenant, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sink_id, outcome.sink_id);
        assert!(record.created);
    }

    #[tokio::test]
    async fn test_updates_via_recorded_sink_id() {
        let store = InMemorySyncStore::new();
        let adapter = FakeAdapter::new(EntityKind::Product);
        let tenant = Uuid::new_v4();
        let opts = ReconcileOptions::default();

        let first = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(1, "Desk", Some("DESK-1")),
            &opts,
        )
        .await
        .unwrap();
        let second = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(1, "Desk v2", Some("DESK-1")),
            &opts,
        )
        .await
        .unwrap();

        assert_eq!(second.action, SyncAction::Updated);
        assert_eq!(second.sink_id, first.sink_id);
    }

    #[tokio::test]
    async fn test_resolves_by_natural_key_without_record() {
        let store = InMemorySyncStore::new();
        let adapter = FakeAdapter::new(EntityKind::Product);
        let tenant = Uuid::new_v4();
        adapter
            .seed(500, json!({"id": 500, "name": "Desk", "sku": "DESK-1"}))
            .await;

        let outcome = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(1, "Desk", Some("DESK-1")),
            &ReconcileOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.action, SyncAction::Updated);
        assert_eq!(outcome.sink_id, Some(500));
    }

    #[tokio::test]
    async fn test_conflict_aborts_with_error() {
        let store = InMemorySyncStore::new();
        let adapter = FakeAdapter::new(EntityKind::Product);
        let tenant = Uuid::new_v4();

        // Sink id 500 already belongs to source entity 99.
        adapter
            .seed(500, json!({"id": 500, "name": "Other", "sku": "DESK-1"}))
            .await;
        store
            .upsert_result(
                EntityKind::Product,
                tenant,
                99,
                &SyncRecordResult {
                    sink_id: Some(500),
                    created: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(1, "Desk", Some("DESK-1")),
            &ReconcileOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.action, SyncAction::Error);
        assert!(outcome.message.contains("already mapped"));

        // The existing mapping is untouched; the new entity carries the
        // error flag.
        let other = store
            .find_by_source_id(EntityKind::Product, tenant, 99)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.sink_id, Some(500));
        let failed = store
            .find_by_source_id(EntityKind::Product, tenant, 1)
            .await
            .unwrap()
            .unwrap();
        assert!(failed.error);
        assert!(failed.sink_id.is_none());
    }

    #[tokio::test]
    async fn test_skips_when_creation_disabled() {
        let store = InMemorySyncStore::new();
        let adapter = FakeAdapter::new(EntityKind::Tag);
        let tenant = Uuid::new_v4();

        let opts = ReconcileOptions {
            create_if_missing: false,
            ..Default::default()
        };
        let outcome = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(1, "Sale", None),
            &opts,
        )
        .await
        .unwrap();

        assert_eq!(outcome.action, SyncAction::Skipped);
    }

    #[tokio::test]
    async fn test_lock_contention_skips() {
        let store = InMemorySyncStore::new();
        let adapter = FakeAdapter::new(EntityKind::Product);
        let broker = InMemoryLockBroker::new();
        let tenant = Uuid::new_v4();

        // Hold the entity's lock so the reconciler cannot get it.
        let key = Lease::key_for(EntityKind::Product, 1, tenant);
        let _held = broker
            .acquire(
                &key,
                LockOptions {
                    wait: std::time::Duration::from_millis(10),
                    ttl: std::time::Duration::from_secs(60),
                },
            )
            .await
            .unwrap();

        let opts = ReconcileOptions {
            lock: LockOptions {
                wait: std::time::Duration::from_millis(50),
                ttl: std::time::Duration::from_secs(60),
            },
            ..Default::default()
        };
        let outcome = reconcile_entity(
            &store,
            Some(&broker),
            &adapter,
            tenant,
            &entity(1, "Desk", Some("DESK-1")),
            &opts,
        )
        .await
        .unwrap();

        assert_eq!(outcome.action, SyncAction::Skipped);
        assert!(outcome.message.contains("Another worker"));
        // No sink write happened.
        assert!(adapter.docs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_create_failure_records_error() {
        let store = InMemorySyncStore::new();
        let mut adapter = FakeAdapter::new(EntityKind::Category);
        adapter.fail_create = true;
        let tenant = Uuid::new_v4();

        let outcome = reconcile_entity(
            &store,
            None,
            &adapter,
            tenant,
            &entity(3, "Office", None),
            &ReconcileOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.action, SyncAction::Error);
        let record = store
            .find_by_source_id(EntityKind::Category, tenant, 3)
            .await
            .unwrap()
            .unwrap();
        assert!(record.error);
        assert!(record.error_details.is_some());
    }

    #[tokio::test]
    async fn test_batch_summary_counts() {
        let mut summary = SyncBatchSummary::default();
        summary.record(&SyncOutcome {
            action: SyncAction::Created,
            source_id: 1,
            sink_id: Some(1),
            message: String::new(),
            error_details: None,
        });
        summary.record(&SyncOutcome::skipped(2, "locked"));
        summary.record(&SyncOutcome {
            action: SyncAction::Error,
            source_id: 3,
            sink_id: None,
            message: String::new(),
            error_details: None,
        });

        assert_eq!(summary.total, 3);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.updated, 0);
    }
}
