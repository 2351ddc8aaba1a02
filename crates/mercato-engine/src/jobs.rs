//! Task implementations.
//!
//! [`JobRunner`] is the worker's [`TaskHandler`]: it resolves the
//! tenant's instance, builds source/sink clients from its credentials
//! (clients are constructed per task, never cached across tenants) and
//! runs the requested sync operation through the reconciler.

use async_trait::async_trait;
use chrono::Utc;
use mercato_core::{EntityKind, TaskId};
use mercato_db::{Instance, PricelistBinding, TaskRecord, WebhookEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{
    AttributeAdapter, AttributeValueAdapter, CategoryAdapter, ProductAdapter, TagAdapter,
};
use crate::alerts::{notify, Alert, AlertSink};
use crate::classifier::{classify, SyncStatus};
use crate::hierarchy::{build_chain, nodes_by_id, CategoryNode};
use crate::lock::LockBroker;
use crate::pricing::{PriceEngine, PriceRule, ProductPricing};
use crate::queue::{Dispatcher, TaskKind};
use crate::reconciler::{
    reconcile_entity, ReconcileError, ReconcileOptions, SourceEntity, SyncBatchSummary,
    SyncOutcome,
};
use crate::store::PgSyncStore;
use crate::worker::{TaskHandler, TaskRunError};
use mercato_connector::{
    normalize_record, ConnectorError, SinkClient, SinkConfig, SourceClient, SourceConfig,
};

/// Errors from job execution.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Instance {0} not found or inactive")]
    MissingInstance(Uuid),

    #[error("Invalid task arguments: {0}")]
    BadArgs(String),

    #[error("Entity {0} not found in source")]
    MissingSourceEntity(i64),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sync failed: {0}")]
    SyncFailed(String),
}

impl From<ReconcileError> for JobError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Connector(e) => JobError::Connector(e),
            ReconcileError::Store(crate::store::StoreError::Database(e)) => JobError::Database(e),
        }
    }
}

impl From<JobError> for TaskRunError {
    fn from(err: JobError) -> Self {
        match &err {
            // Database hiccups and transient connector failures are
            // worth retrying; everything else fails terminally.
            JobError::Database(_) => TaskRunError::Retryable(err.to_string()),
            JobError::Connector(e) if e.is_retryable() => {
                TaskRunError::Retryable(err.to_string())
            }
            _ => TaskRunError::Terminal(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Task arguments
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_quantity() -> f64 {
    1.0
}

fn default_page_size() -> i64 {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncProductArgs {
    pub product_id: i64,
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
    #[serde(default = "default_true")]
    pub update_existing: bool,
    #[serde(default = "default_true")]
    pub with_prices: bool,
    /// Sync even when the source has not written since the last sync.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncCategoryChainArgs {
    pub target_id: i64,
    /// Remaining links, root-first. Absent on the initial request; the
    /// first execution expands the target into its full chain.
    #[serde(default)]
    pub chain: Option<Vec<CategoryNode>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncTagArgs {
    pub tag_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAttributeArgs {
    pub attribute_id: i64,
    #[serde(default = "default_true")]
    pub include_values: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAttributeValueArgs {
    pub value_id: i64,
    pub attribute_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncProductPricesArgs {
    pub product_id: i64,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessWebhookArgs {
    pub event_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FullProductSyncArgs {
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

// ---------------------------------------------------------------------------
// Job runner
// ---------------------------------------------------------------------------

/// Executes queued sync tasks.
pub struct JobRunner {
    pool: sqlx::PgPool,
    broker: Option<Arc<dyn LockBroker>>,
    alerts: Arc<dyn AlertSink>,
    dispatcher: Dispatcher,
}

impl JobRunner {
    pub fn new(
        pool: sqlx::PgPool,
        broker: Option<Arc<dyn LockBroker>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let dispatcher = Dispatcher::new(pool.clone());
        Self {
            pool,
            broker,
            alerts,
            dispatcher,
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn broker(&self) -> Option<&dyn LockBroker> {
        self.broker.as_deref()
    }

    /// Resolve the tenant's instance and build its API clients.
    async fn tenant_clients(
        &self,
        tenant_id: Uuid,
    ) -> Result<(Instance, Arc<SourceClient>, Arc<SinkClient>), JobError> {
        let instance = Instance::find_by_id(&self.pool, tenant_id)
            .await?
            .filter(|instance| instance.active)
            .ok_or(JobError::MissingInstance(tenant_id))?;

        let source = SourceClient::new(SourceConfig::new(
            instance.source_url.clone(),
            instance.source_db.clone(),
            instance.source_username.clone(),
            instance.source_api_key.clone(),
        ))?;
        let sink = SinkClient::new(SinkConfig::new(
            instance.sink_url.clone(),
            instance.sink_consumer_key.clone(),
            instance.sink_consumer_secret.clone(),
        ))?;
        Ok((instance, Arc::new(source), Arc::new(sink)))
    }

    /// Fetch and normalize one source record, by id.
    async fn fetch_source_record(
        &self,
        source: &SourceClient,
        model: &str,
        id: i64,
        fields: &[&str],
    ) -> Result<Value, JobError> {
        let rows = source
            .search_read(model, json!([["id", "=", id]]), fields, Some(1), None)
            .await?;
        rows.first()
            .map(normalize_record)
            .ok_or(JobError::MissingSourceEntity(id))
    }

    // -- products ----------------------------------------------------------

    async fn sync_product(&self, tenant_id: Uuid, args: &SyncProductArgs) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;
        let outcome = self
            .sync_product_inner(tenant_id, &source, &sink, args)
            .await?;
        outcome_result(outcome)
    }

    async fn sync_product_inner(
        &self,
        tenant_id: Uuid,
        source: &Arc<SourceClient>,
        sink: &Arc<SinkClient>,
        args: &SyncProductArgs,
    ) -> Result<SyncOutcome, JobError> {
        let data = self
            .fetch_source_record(
                source,
                "product.template",
                args.product_id,
                &[
                    "id",
                    "name",
                    "default_code",
                    "list_price",
                    "standard_price",
                    "write_date",
                    "active",
                    "categ_id",
                    "description",
                    "description_sale",
                    "weight",
                    "product_tag_ids",
                ],
            )
            .await?;

        let store = PgSyncStore::new(self.pool.clone());
        let entity = source_entity(args.product_id, &data);

        // Change detection: an unmodified product is skipped unless the
        // caller forces the sync.
        if !args.force {
            let record = mercato_db::SyncRecord::find_by_source_id(
                &self.pool,
                EntityKind::Product,
                tenant_id,
                args.product_id,
            )
            .await?;
            let write_date = data.get("write_date").and_then(Value::as_str);
            if classify(write_date, record.as_ref()) == SyncStatus::Synced {
                return Ok(SyncOutcome {
                    action: crate::reconciler::SyncAction::Skipped,
                    source_id: args.product_id,
                    sink_id: record.and_then(|r| r.sink_id),
                    message: "Product unchanged since last sync".to_string(),
                    error_details: None,
                });
            }
        }

        // Resolve references to already-reconciled categories and tags;
        // unresolved references are dropped, not synthesized here.
        let mut category_sink_ids = Vec::new();
        if let Some(categ_id) = data.get("categ_id").and_then(Value::as_i64) {
            match mercato_db::SyncRecord::find_by_source_id(
                &self.pool,
                EntityKind::Category,
                tenant_id,
                categ_id,
            )
            .await?
            .and_then(|r| r.sink_id)
            {
                Some(sink_id) => category_sink_ids.push(sink_id),
                None => {
                    info!(
                        category_id = categ_id,
                        "Product category not yet synced, omitting reference"
                    );
                }
            }
        }

        let mut tag_sink_ids = Vec::new();
        if let Some(tag_ids) = data.get("product_tag_ids").and_then(Value::as_array) {
            for tag_id in tag_ids.iter().filter_map(Value::as_i64) {
                if let Some(sink_id) = mercato_db::SyncRecord::find_by_source_id(
                    &self.pool,
                    EntityKind::Tag,
                    tenant_id,
                    tag_id,
                )
                .await?
                .and_then(|r| r.sink_id)
                {
                    tag_sink_ids.push(sink_id);
                }
            }
        }

        let mut adapter = ProductAdapter::new(sink.clone())
            .with_categories(category_sink_ids)
            .with_tags(tag_sink_ids);

        if args.with_prices {
            let bindings = PricelistBinding::list_active_by_tenant(&self.pool, tenant_id).await?;
            if !bindings.is_empty() {
                let engine = self.load_price_engine(source, &bindings).await?;
                let pricing = product_pricing(args.product_id, &data);
                let fields = engine.price_fields(&pricing, &bindings, 1.0, Utc::now());
                if !fields.is_empty() {
                    adapter = adapter.with_price_fields(fields);
                }
            }
        }

        let opts = ReconcileOptions {
            create_if_missing: args.create_if_missing,
            update_existing: args.update_existing,
            ..Default::default()
        };
        Ok(reconcile_entity(&store, self.broker(), &adapter, tenant_id, &entity, &opts).await?)
    }

    // -- categories --------------------------------------------------------

    async fn sync_category_chain(
        &self,
        task: &TaskRecord,
        tenant_id: Uuid,
        args: SyncCategoryChainArgs,
    ) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;

        let chain = match args.chain {
            Some(chain) => chain,
            None => {
                // First execution: expand the target into its full
                // root→target chain.
                let rows = source
                    .search_read(
                        "product.category",
                        json!([]),
                        &["id", "name", "parent_id"],
                        None,
                        None,
                    )
                    .await?;
                let nodes = nodes_by_id(
                    rows.iter()
                        .map(normalize_record)
                        .filter_map(|record| category_node(&record))
                        .collect(),
                );
                let chain = build_chain(args.target_id, &nodes);
                if chain.is_empty() {
                    return Err(JobError::MissingSourceEntity(args.target_id));
                }
                info!(
                    target_id = args.target_id,
                    links = chain.len(),
                    "Category chain resolved"
                );
                chain
            }
        };

        let (link, rest) = chain
            .split_first()
            .ok_or_else(|| JobError::BadArgs("empty category chain".to_string()))?;

        // The parent was reconciled by the previous link of the chain;
        // its sink id must be visible before this link creates anything.
        let parent_sink_id = match link.parent_id {
            Some(parent_id) => {
                mercato_db::SyncRecord::find_by_source_id(
                    &self.pool,
                    EntityKind::Category,
                    tenant_id,
                    parent_id,
                )
                .await?
                .and_then(|r| r.sink_id)
            }
            None => None,
        };
        if link.parent_id.is_some() && parent_sink_id.is_none() {
            return Err(JobError::SyncFailed(format!(
                "parent category {} has no sink id; chain must run root-first",
                link.parent_id.unwrap_or_default()
            )));
        }

        let store = PgSyncStore::new(self.pool.clone());
        let adapter = CategoryAdapter::new(sink.clone()).with_parent(parent_sink_id);
        let entity = SourceEntity {
            source_id: link.id,
            name: link.name.clone(),
            natural_key: Some(link.name.clone()),
            write_date: None,
            data: json!({"parent_id": link.parent_id}),
        };
        let outcome = reconcile_entity(
            &store,
            self.broker(),
            &adapter,
            tenant_id,
            &entity,
            &ReconcileOptions::default(),
        )
        .await?;

        if outcome.is_error() {
            return Err(JobError::SyncFailed(outcome.message));
        }

        // Strict linear chain: the next link is enqueued only after this
        // link's create has committed, as a child of this task.
        if !rest.is_empty() {
            self.dispatcher
                .enqueue(
                    TaskKind::SyncCategoryChain,
                    Some(tenant_id),
                    serde_json::to_value(SyncCategoryChainArgs {
                        target_id: args.target_id,
                        chain: Some(rest.to_vec()),
                    })
                    .unwrap_or_default(),
                    Some(TaskId::from_uuid(task.task_id)),
                )
                .await
                .map_err(|e| match e {
                    crate::queue::DispatchError::Database(e) => JobError::Database(e),
                })?;
        }

        Ok(json!({
            "outcome": outcome,
            "remaining_links": rest.len(),
        }))
    }

    // -- tags and attributes -----------------------------------------------

    async fn sync_tag(&self, tenant_id: Uuid, args: &SyncTagArgs) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;
        let data = self
            .fetch_source_record(&source, "product.tag", args.tag_id, &["id", "name"])
            .await?;

        let store = PgSyncStore::new(self.pool.clone());
        let adapter = TagAdapter::new(sink);
        let outcome = reconcile_entity(
            &store,
            self.broker(),
            &adapter,
            tenant_id,
            &source_entity(args.tag_id, &data),
            &ReconcileOptions::default(),
        )
        .await?;
        outcome_result(outcome)
    }

    async fn sync_attribute(
        &self,
        task: &TaskRecord,
        tenant_id: Uuid,
        args: &SyncAttributeArgs,
    ) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;
        let data = self
            .fetch_source_record(&source, "product.attribute", args.attribute_id, &["id", "name"])
            .await?;

        let store = PgSyncStore::new(self.pool.clone());
        let adapter = AttributeAdapter::new(sink);
        let outcome = reconcile_entity(
            &store,
            self.broker(),
            &adapter,
            tenant_id,
            &source_entity(args.attribute_id, &data),
            &ReconcileOptions::default(),
        )
        .await?;
        if outcome.is_error() {
            return Err(JobError::SyncFailed(outcome.message));
        }

        // Fan the attribute's values out as child tasks; each value goes
        // through the full reconciler on its own.
        let mut values_enqueued = 0;
        if args.include_values {
            let values = source
                .search_read(
                    "product.attribute.value",
                    json!([["attribute_id", "=", args.attribute_id]]),
                    &["id", "name"],
                    None,
                    None,
                )
                .await?;
            for value in &values {
                let normalized = normalize_record(value);
                let Some(value_id) = normalized.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                self.dispatcher
                    .enqueue(
                        TaskKind::SyncAttributeValue,
                        Some(tenant_id),
                        serde_json::to_value(SyncAttributeValueArgs {
                            value_id,
                            attribute_id: args.attribute_id,
                        })
                        .unwrap_or_default(),
                        Some(TaskId::from_uuid(task.task_id)),
                    )
                    .await
                    .map_err(|e| match e {
                        crate::queue::DispatchError::Database(e) => JobError::Database(e),
                    })?;
                values_enqueued += 1;
            }
        }

        Ok(json!({
            "outcome": outcome,
            "values_enqueued": values_enqueued,
        }))
    }

    async fn sync_attribute_value(
        &self,
        tenant_id: Uuid,
        args: &SyncAttributeValueArgs,
    ) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;

        let attribute_sink_id = mercato_db::SyncRecord::find_by_source_id(
            &self.pool,
            EntityKind::Attribute,
            tenant_id,
            args.attribute_id,
        )
        .await?
        .and_then(|r| r.sink_id)
        .ok_or_else(|| {
            JobError::SyncFailed(format!(
                "attribute {} not synced; sync it before its values",
                args.attribute_id
            ))
        })?;

        let data = self
            .fetch_source_record(&source, "product.attribute.value", args.value_id, &["id", "name"])
            .await?;

        let store = PgSyncStore::new(self.pool.clone());
        let adapter = AttributeValueAdapter::new(sink, attribute_sink_id);
        let outcome = reconcile_entity(
            &store,
            self.broker(),
            &adapter,
            tenant_id,
            &source_entity(args.value_id, &data),
            &ReconcileOptions::default(),
        )
        .await?;
        outcome_result(outcome)
    }

    // -- prices ------------------------------------------------------------

    async fn sync_product_prices(
        &self,
        tenant_id: Uuid,
        args: &SyncProductPricesArgs,
    ) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;

        let record = mercato_db::SyncRecord::find_by_source_id(
            &self.pool,
            EntityKind::Product,
            tenant_id,
            args.product_id,
        )
        .await?;
        let Some(sink_id) = record.and_then(|r| r.sink_id) else {
            return Err(JobError::SyncFailed(format!(
                "product {} not synced to the sink",
                args.product_id
            )));
        };

        let bindings = PricelistBinding::list_active_by_tenant(&self.pool, tenant_id).await?;
        if bindings.is_empty() {
            warn!(tenant_id = %tenant_id, "No active price list bindings configured");
            return Ok(json!({"synced": 0, "message": "no active pricelist bindings"}));
        }

        let data = self
            .fetch_source_record(
                &source,
                "product.template",
                args.product_id,
                &["id", "list_price", "standard_price", "categ_id"],
            )
            .await?;
        let engine = self.load_price_engine(&source, &bindings).await?;
        let pricing = product_pricing(args.product_id, &data);
        let fields = engine.price_fields(&pricing, &bindings, args.quantity, Utc::now());

        if fields.is_empty() {
            return Ok(json!({"synced": 0, "message": "no prices to sync"}));
        }

        let payload = fields.to_sink_payload();
        info!(
            product_id = args.product_id,
            sink_id = sink_id,
            "Pushing computed prices to sink"
        );
        let sync_result = sink.put(&format!("products/{sink_id}"), &payload).await;

        let error_text = sync_result.as_ref().err().map(ToString::to_string);
        for binding in &bindings {
            PricelistBinding::update_sync_status(
                &self.pool,
                tenant_id,
                binding.id,
                error_text.as_deref(),
            )
            .await?;
        }
        sync_result?;

        let synced = usize::from(fields.regular_price.is_some())
            + usize::from(fields.sale_price.is_some())
            + fields.meta_data.len();
        Ok(json!({"synced": synced, "sink_id": sink_id}))
    }

    /// Load the pricing rules of every bound price list into an engine.
    async fn load_price_engine(
        &self,
        source: &SourceClient,
        bindings: &[PricelistBinding],
    ) -> Result<PriceEngine, JobError> {
        let pricelist_ids: Vec<i64> = bindings.iter().map(|b| b.source_pricelist_id).collect();
        let rows = source
            .search_read(
                "product.pricelist.item",
                json!([["pricelist_id", "in", pricelist_ids]]),
                &[
                    "id",
                    "pricelist_id",
                    "applied_on",
                    "product_id",
                    "product_tmpl_id",
                    "categ_id",
                    "min_quantity",
                    "compute_price",
                    "fixed_price",
                    "percent_price",
                    "price_discount",
                    "price_surcharge",
                    "price_min_margin",
                    "price_max_margin",
                    "base",
                    "base_pricelist_id",
                    "date_start",
                    "date_end",
                ],
                None,
                None,
            )
            .await?;

        let rules: Vec<PriceRule> = rows
            .iter()
            .map(normalize_record)
            .filter_map(|record| PriceRule::from_source(&record))
            .collect();
        Ok(PriceEngine::new(rules))
    }

    // -- webhooks ----------------------------------------------------------

    /// Process one accepted webhook event.
    ///
    /// Public because the webhook gateway falls back to running this
    /// synchronously when the event cannot be enqueued.
    pub async fn process_webhook(
        &self,
        tenant_id: Uuid,
        args: &ProcessWebhookArgs,
    ) -> Result<Value, JobError> {
        let event = WebhookEvent::find_by_event_id(&self.pool, &args.event_id)
            .await?
            .ok_or_else(|| JobError::BadArgs(format!("webhook event {} not found", args.event_id)))?;

        let result = self.apply_webhook(tenant_id, &event).await;
        match &result {
            Ok(_) => WebhookEvent::complete(&self.pool, &args.event_id).await?,
            Err(e) => {
                // Retryable failures keep the event in `processing` so
                // the redelivered task can finish it; terminal failures
                // are recorded on the event.
                if !matches!(e, JobError::Connector(c) if c.is_retryable())
                    && !matches!(e, JobError::Database(_))
                {
                    WebhookEvent::fail(&self.pool, &args.event_id, &e.to_string()).await?;
                }
            }
        }
        result
    }

    /// Apply one sink-originated change back to the source system.
    async fn apply_webhook(&self, tenant_id: Uuid, event: &WebhookEvent) -> Result<Value, JobError> {
        let (_, source, _) = self.tenant_clients(tenant_id).await?;
        let payload = &event.payload;

        match event.event_type.as_str() {
            "product.created" | "product.updated" => {
                let values = json!({
                    "name": payload.get("name").and_then(Value::as_str).unwrap_or_default(),
                    "default_code": payload.get("sku").and_then(Value::as_str),
                    "list_price": payload
                        .get("price")
                        .and_then(Value::as_str)
                        .and_then(|p| p.parse::<f64>().ok())
                        .or_else(|| payload.get("price").and_then(Value::as_f64))
                        .unwrap_or(0.0),
                    "sale_ok": true,
                    "active": payload.get("status").and_then(Value::as_str) == Some("publish"),
                });

                let sku = payload.get("sku").and_then(Value::as_str).unwrap_or_default();
                let existing = if sku.is_empty() {
                    Vec::new()
                } else {
                    source
                        .search_read(
                            "product.template",
                            json!([["default_code", "=", sku]]),
                            &["id"],
                            Some(1),
                            None,
                        )
                        .await?
                };

                if let Some(id) = existing.first().and_then(|p| p.get("id")).and_then(Value::as_i64)
                {
                    source.write("product.template", &[id], values).await?;
                    Ok(json!({"action": "updated", "source_id": id}))
                } else {
                    let id = source.create("product.template", values).await?;
                    Ok(json!({"action": "created", "source_id": id}))
                }
            }
            "product.deleted" => {
                let sku = payload.get("sku").and_then(Value::as_str).unwrap_or_default();
                if sku.is_empty() {
                    return Ok(json!({"action": "ignored", "reason": "no sku in payload"}));
                }
                let existing = source
                    .search_read(
                        "product.template",
                        json!([["default_code", "=", sku]]),
                        &["id"],
                        Some(1),
                        None,
                    )
                    .await?;
                if let Some(id) = existing.first().and_then(|p| p.get("id")).and_then(Value::as_i64)
                {
                    // Archive instead of delete: the source keeps history.
                    source
                        .write("product.template", &[id], json!({"active": false}))
                        .await?;
                    Ok(json!({"action": "archived", "source_id": id}))
                } else {
                    Ok(json!({"action": "ignored", "reason": "unknown sku"}))
                }
            }
            other => {
                info!(event_type = other, "Unhandled webhook event type");
                Ok(json!({"action": "ignored", "reason": "event type not handled"}))
            }
        }
    }

    // -- bulk --------------------------------------------------------------

    async fn full_product_sync(
        &self,
        tenant_id: Uuid,
        args: &FullProductSyncArgs,
    ) -> Result<Value, JobError> {
        let (_, source, sink) = self.tenant_clients(tenant_id).await?;

        let mut summary = SyncBatchSummary::default();
        let mut details = Vec::new();
        let mut offset = 0;

        loop {
            let page = source
                .search_read(
                    "product.template",
                    json!([["sale_ok", "=", true]]),
                    &["id"],
                    Some(args.page_size),
                    Some(offset),
                )
                .await?;
            if page.is_empty() {
                break;
            }

            for row in &page {
                let Some(product_id) = row.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let product_args = SyncProductArgs {
                    product_id,
                    create_if_missing: true,
                    update_existing: true,
                    with_prices: true,
                    force: false,
                };
                // One entity's failure never aborts its siblings; every
                // outcome lands in the aggregate.
                match self
                    .sync_product_inner(tenant_id, &source, &sink, &product_args)
                    .await
                {
                    Ok(outcome) => {
                        summary.record(&outcome);
                        details.push(serde_json::to_value(&outcome).unwrap_or_default());
                    }
                    Err(e) => {
                        warn!(product_id = product_id, error = %e, "Product sync failed");
                        summary.total += 1;
                        summary.errors += 1;
                        details.push(json!({
                            "action": "error",
                            "source_id": product_id,
                            "message": e.to_string(),
                        }));
                    }
                }
            }

            offset += args.page_size;
        }

        info!(
            total = summary.total,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors,
            "Full product sync completed"
        );
        notify(&self.alerts, Alert::sync_completed(tenant_id, &summary));

        Ok(json!({"summary": summary, "details": details}))
    }
}

#[async_trait]
impl TaskHandler for JobRunner {
    async fn handle(&self, task: &TaskRecord) -> Result<Value, TaskRunError> {
        let kind: TaskKind = task
            .task_name
            .parse()
            .map_err(TaskRunError::Terminal)?;
        let tenant_id = task
            .tenant_id
            .ok_or_else(|| TaskRunError::Terminal("task has no tenant".to_string()))?;

        let parse = |err: serde_json::Error| {
            TaskRunError::Terminal(format!("invalid task arguments: {err}"))
        };

        let result = match kind {
            TaskKind::SyncProduct => {
                let args: SyncProductArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.sync_product(tenant_id, &args).await
            }
            TaskKind::SyncCategoryChain => {
                let args: SyncCategoryChainArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.sync_category_chain(task, tenant_id, args).await
            }
            TaskKind::SyncTag => {
                let args: SyncTagArgs = serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.sync_tag(tenant_id, &args).await
            }
            TaskKind::SyncAttribute => {
                let args: SyncAttributeArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.sync_attribute(task, tenant_id, &args).await
            }
            TaskKind::SyncAttributeValue => {
                let args: SyncAttributeValueArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.sync_attribute_value(tenant_id, &args).await
            }
            TaskKind::SyncProductPrices => {
                let args: SyncProductPricesArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.sync_product_prices(tenant_id, &args).await
            }
            TaskKind::ProcessWebhook => {
                let args: ProcessWebhookArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.process_webhook(tenant_id, &args).await
            }
            TaskKind::FullProductSync => {
                let args: FullProductSyncArgs =
                    serde_json::from_value(task.args.clone()).map_err(parse)?;
                self.full_product_sync(tenant_id, &args).await
            }
        };

        result.map_err(TaskRunError::from)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a [`SourceEntity`] from a normalized source record.
fn source_entity(source_id: i64, data: &Value) -> SourceEntity {
    SourceEntity {
        source_id,
        name: data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        natural_key: data
            .get("default_code")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        write_date: data
            .get("write_date")
            .and_then(Value::as_str)
            .and_then(crate::classifier::parse_source_datetime),
        data: data.clone(),
    }
}

/// Build a [`CategoryNode`] from a normalized source record.
fn category_node(record: &Value) -> Option<CategoryNode> {
    Some(CategoryNode {
        id: record.get("id")?.as_i64()?,
        name: record.get("name")?.as_str()?.to_string(),
        parent_id: record.get("parent_id").and_then(Value::as_i64),
    })
}

/// Pricing-relevant fields of a normalized product record.
fn product_pricing(product_id: i64, data: &Value) -> ProductPricing {
    ProductPricing {
        variant_id: product_id,
        template_id: product_id,
        category_id: data.get("categ_id").and_then(Value::as_i64),
        list_price: data.get("list_price").and_then(Value::as_f64).unwrap_or(0.0),
        standard_price: data
            .get("standard_price")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    }
}

/// Convert an outcome into a task result, failing the task when the
/// entity ended in an error outcome.
fn outcome_result(outcome: SyncOutcome) -> Result<Value, JobError> {
    if outcome.is_error() {
        return Err(JobError::SyncFailed(outcome.message));
    }
    Ok(serde_json::to_value(&outcome).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_entity_from_record() {
        let data = json!({
            "name": "Desk",
            "default_code": "DESK-1",
            "write_date": "2024-01-15 10:30:45",
        });
        let entity = source_entity(42, &data);
        assert_eq!(entity.source_id, 42);
        assert_eq!(entity.name, "Desk");
        assert_eq!(entity.natural_key.as_deref(), Some("DESK-1"));
        assert!(entity.write_date.is_some());
    }

    #[test]
    fn test_category_node_requires_id_and_name() {
        assert!(category_node(&json!({"id": 1, "name": "All"})).is_some());
        assert!(category_node(&json!({"id": 1})).is_none());
        let node = category_node(&json!({"id": 2, "name": "Office", "parent_id": 1})).unwrap();
        assert_eq!(node.parent_id, Some(1));
    }

    #[test]
    fn test_product_pricing_defaults() {
        let pricing = product_pricing(5, &json!({"list_price": 10.0}));
        assert_eq!(pricing.list_price, 10.0);
        assert_eq!(pricing.standard_price, 0.0);
        assert!(pricing.category_id.is_none());
    }

    #[test]
    fn test_args_defaults() {
        let args: SyncProductArgs = serde_json::from_value(json!({"product_id": 1})).unwrap();
        assert!(args.create_if_missing);
        assert!(args.update_existing);
        assert!(args.with_prices);
        assert!(!args.force);

        let args: FullProductSyncArgs = serde_json::from_value(json!({})).unwrap();
        assert_eq!(args.page_size, 50);
    }

    #[test]
    fn test_job_error_retry_mapping() {
        let transient = JobError::Connector(ConnectorError::Transient {
            message: "timeout".to_string(),
            status: None,
        });
        assert!(matches!(
            TaskRunError::from(transient),
            TaskRunError::Retryable(_)
        ));

        let validation = JobError::Connector(ConnectorError::Validation {
            message: "bad".to_string(),
        });
        assert!(matches!(
            TaskRunError::from(validation),
            TaskRunError::Terminal(_)
        ));

        let missing = JobError::MissingSourceEntity(9);
        assert!(matches!(
            TaskRunError::from(missing),
            TaskRunError::Terminal(_)
        ));
    }
}
