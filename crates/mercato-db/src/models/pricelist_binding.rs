//! Price list binding model.
//!
//! A binding maps one source price list to a sink price field for a
//! tenant: the `regular` price, the `sale` price, or a metadata key.
//! At most one binding is the active primary per tenant; activating one
//! deactivates the others in the same transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which sink price field a binding feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Regular,
    Sale,
    Meta,
}

impl std::fmt::Display for PriceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceType::Regular => write!(f, "regular"),
            PriceType::Sale => write!(f, "sale"),
            PriceType::Meta => write!(f, "meta"),
        }
    }
}

/// One source-pricelist-to-sink-field binding.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PricelistBinding {
    pub id: Uuid,
    pub tenant_id: Uuid,

    /// Price list id in the source system.
    pub source_pricelist_id: i64,

    pub name: String,
    pub price_type: PriceType,

    /// Metadata key, required when `price_type` is `meta`.
    pub meta_key: Option<String>,

    pub active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPricelistBinding {
    pub source_pricelist_id: i64,
    pub name: String,
    pub price_type: PriceType,
    pub meta_key: Option<String>,
}

impl PricelistBinding {
    /// List all bindings for a tenant.
    pub async fn list_by_tenant(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM pricelist_bindings
            WHERE tenant_id = $1
            ORDER BY created_at ASC
            ",
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await
    }

    /// List active bindings for a tenant.
    pub async fn list_active_by_tenant(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM pricelist_bindings
            WHERE tenant_id = $1 AND active = true
            ORDER BY created_at ASC
            ",
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await
    }

    /// Create an inactive binding.
    pub async fn create(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
        input: &NewPricelistBinding,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO pricelist_bindings (
                id, tenant_id, source_pricelist_id, name, price_type,
                meta_key, active
            )
            VALUES ($1, $2, $3, $4, $5, $6, false)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(input.source_pricelist_id)
        .bind(&input.name)
        .bind(input.price_type)
        .bind(&input.meta_key)
        .fetch_one(pool)
        .await
    }

    /// Activate one binding as the tenant's primary.
    ///
    /// All other bindings of the tenant are deactivated in the same
    /// transaction, so at most one binding is ever active-primary.
    pub async fn activate(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
        binding_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
            UPDATE pricelist_bindings
            SET active = false, updated_at = NOW()
            WHERE tenant_id = $1 AND id != $2
            ",
        )
        .bind(tenant_id)
        .bind(binding_id)
        .execute(&mut *tx)
        .await?;

        let activated: Option<Self> = sqlx::query_as(
            r"
            UPDATE pricelist_bindings
            SET active = true, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            RETURNING *
            ",
        )
        .bind(tenant_id)
        .bind(binding_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(activated)
    }

    /// Deactivate a binding.
    pub async fn deactivate(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
        binding_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE pricelist_bindings
            SET active = false, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            RETURNING *
            ",
        )
        .bind(tenant_id)
        .bind(binding_id)
        .fetch_optional(pool)
        .await
    }

    /// Record the outcome of the last price sync through this binding.
    pub async fn update_sync_status(
        pool: &sqlx::PgPool,
        tenant_id: Uuid,
        binding_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE pricelist_bindings
            SET last_synced_at = NOW(), sync_error = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            ",
        )
        .bind(tenant_id)
        .bind(binding_id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }
}
