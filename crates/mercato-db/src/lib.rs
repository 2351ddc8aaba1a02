//! # Mercato DB
//!
//! Postgres persistence for the sync service: tenant instances, per-kind
//! sync-record tables, the webhook event log, the task record tree (which
//! doubles as the work queue) and price-list bindings.
//!
//! Models are plain structs with `async fn` accessors taking a
//! [`sqlx::PgPool`]; all tenant-owned tables are scoped by `tenant_id`.

pub mod error;
pub mod models;

pub use error::DbError;
pub use models::instance::{Instance, NewInstance};
pub use models::pricelist_binding::{NewPricelistBinding, PriceType, PricelistBinding};
pub use models::sync_record::{SyncCounts, SyncRecord, SyncRecordResult};
pub use models::task_record::{NewTask, TaskRecord, TaskStatus};
pub use models::webhook_event::{WebhookEvent, WebhookStatus};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Connect to Postgres with the pool settings used across the workspace.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(DbError::ConnectionFailed)
}

/// Run all pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(DbError::MigrationFailed)?;
    tracing::info!("Database migrations applied");
    Ok(())
}
