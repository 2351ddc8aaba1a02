//! Tenant instance model.
//!
//! An instance pairs one authoritative source system with one storefront
//! sink and carries the credentials for both. Every other record in the
//! database is owned by exactly one instance via `tenant_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A configured source+sink pairing.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier; used as `tenant_id` throughout the system.
    pub id: Uuid,

    /// Human-readable name.
    pub name: String,

    /// Whether sync flows are enabled for this instance.
    pub active: bool,

    /// Source system JSON-RPC endpoint.
    pub source_url: String,

    /// Source database name.
    pub source_db: String,

    /// Source login.
    pub source_username: String,

    /// Source API key or password.
    pub source_api_key: String,

    /// Sink REST base URL.
    pub sink_url: String,

    /// Sink consumer key.
    pub sink_consumer_key: String,

    /// Sink consumer secret.
    pub sink_consumer_secret: String,

    /// Shared secret for inbound webhook signatures. When absent,
    /// deliveries are accepted unsigned.
    pub webhook_secret: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstance {
    pub name: String,
    pub source_url: String,
    pub source_db: String,
    pub source_username: String,
    pub source_api_key: String,
    pub sink_url: String,
    pub sink_consumer_key: String,
    pub sink_consumer_secret: String,
    pub webhook_secret: Option<String>,
}

impl Instance {
    /// Find an instance by id.
    pub async fn find_by_id(pool: &sqlx::PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM instances
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// List all active instances.
    pub async fn list_active(pool: &sqlx::PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM instances
            WHERE active = true
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(pool)
        .await
    }

    /// Create a new instance, enabled by default.
    pub async fn create(pool: &sqlx::PgPool, input: &NewInstance) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO instances (
                id, name, active, source_url, source_db, source_username,
                source_api_key, sink_url, sink_consumer_key,
                sink_consumer_secret, webhook_secret
            )
            VALUES ($1, $2, true, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.source_url)
        .bind(&input.source_db)
        .bind(&input.source_username)
        .bind(&input.source_api_key)
        .bind(&input.sink_url)
        .bind(&input.sink_consumer_key)
        .bind(&input.sink_consumer_secret)
        .bind(&input.webhook_secret)
        .fetch_one(pool)
        .await
    }

    /// Enable or disable sync flows for an instance.
    pub async fn set_active(
        pool: &sqlx::PgPool,
        id: Uuid,
        active: bool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE instances
            SET active = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(active)
        .fetch_optional(pool)
        .await
    }
}
