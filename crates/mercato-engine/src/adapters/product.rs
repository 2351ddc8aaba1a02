//! Product adapter.

use async_trait::async_trait;
use mercato_core::EntityKind;
use serde_json::{json, Value};
use std::sync::Arc;

use super::slugify;
use crate::pricing::PriceFields;
use crate::reconciler::{EntityAdapter, SourceEntity};
use mercato_connector::sink::paths;
use mercato_connector::{ConnectorError, SinkClient};

/// Reconciles products into the sink.
///
/// Category, tag and price references are resolved by the caller before
/// the adapter is built, so the adapter itself only maps fields. The
/// generated slug embeds the source id, keeping slugs globally unique
/// even when two source products share a name.
pub struct ProductAdapter {
    sink: Arc<SinkClient>,
    category_sink_ids: Vec<i64>,
    tag_sink_ids: Vec<i64>,
    price_fields: Option<PriceFields>,
}

impl ProductAdapter {
    #[must_use]
    pub fn new(sink: Arc<SinkClient>) -> Self {
        Self {
            sink,
            category_sink_ids: Vec::new(),
            tag_sink_ids: Vec::new(),
            price_fields: None,
        }
    }

    /// Sink ids of the product's already-reconciled categories.
    #[must_use]
    pub fn with_categories(mut self, sink_ids: Vec<i64>) -> Self {
        self.category_sink_ids = sink_ids;
        self
    }

    /// Sink ids of the product's already-reconciled tags.
    #[must_use]
    pub fn with_tags(mut self, sink_ids: Vec<i64>) -> Self {
        self.tag_sink_ids = sink_ids;
        self
    }

    /// Computed price fields to push along with the product.
    #[must_use]
    pub fn with_price_fields(mut self, fields: PriceFields) -> Self {
        self.price_fields = Some(fields);
        self
    }

    /// Build the sink payload for one product.
    fn payload(&self, entity: &SourceEntity) -> Value {
        let data = &entity.data;
        let mut payload = serde_json::Map::new();

        payload.insert("name".to_string(), json!(entity.name));
        payload.insert(
            "slug".to_string(),
            json!(format!("{}-{}", slugify(&entity.name), entity.source_id)),
        );
        if let Some(sku) = entity.natural_key.as_deref() {
            payload.insert("sku".to_string(), json!(sku));
        }
        if let Some(price) = data.get("list_price").and_then(Value::as_f64) {
            payload.insert("regular_price".to_string(), json!(format!("{price:.2}")));
        }
        if let Some(description) = data.get("description_sale").and_then(Value::as_str) {
            payload.insert("short_description".to_string(), json!(description));
        }
        if let Some(description) = data.get("description").and_then(Value::as_str) {
            payload.insert("description".to_string(), json!(description));
        }
        if let Some(weight) = data.get("weight").and_then(Value::as_f64) {
            if weight > 0.0 {
                payload.insert("weight".to_string(), json!(weight.to_string()));
            }
        }
        let active = data.get("active").and_then(Value::as_bool).unwrap_or(true);
        payload.insert(
            "status".to_string(),
            json!(if active { "publish" } else { "draft" }),
        );

        if !self.category_sink_ids.is_empty() {
            let refs: Vec<Value> = self
                .category_sink_ids
                .iter()
                .map(|id| json!({"id": id}))
                .collect();
            payload.insert("categories".to_string(), Value::Array(refs));
        }
        if !self.tag_sink_ids.is_empty() {
            let refs: Vec<Value> = self
                .tag_sink_ids
                .iter()
                .map(|id| json!({"id": id}))
                .collect();
            payload.insert("tags".to_string(), Value::Array(refs));
        }

        // Computed prices override the plain list price.
        if let Some(fields) = &self.price_fields {
            if let Value::Object(price_payload) = fields.to_sink_payload() {
                for (key, value) in price_payload {
                    payload.insert(key, value);
                }
            }
        }

        Value::Object(payload)
    }
}

#[async_trait]
impl EntityAdapter for ProductAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Product
    }

    async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError> {
        self.sink.fetch(paths::PRODUCTS, sink_id).await
    }

    async fn fetch_by_natural_key(
        &self,
        entity: &SourceEntity,
    ) -> Result<Option<Value>, ConnectorError> {
        if let Some(sku) = entity.natural_key.as_deref() {
            if let Some(found) = self.sink.find_product_by_sku(sku).await? {
                return Ok(Some(found));
            }
        }
        let slug = format!("{}-{}", slugify(&entity.name), entity.source_id);
        self.sink.find_by_slug(paths::PRODUCTS, &slug).await
    }

    async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError> {
        self.sink.post(paths::PRODUCTS, &self.payload(entity)).await
    }

    async fn update(
        &self,
        sink_id: i64,
        entity: &SourceEntity,
    ) -> Result<Value, ConnectorError> {
        self.sink
            .put(&format!("{}/{sink_id}", paths::PRODUCTS), &self.payload(entity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercato_connector::SinkConfig;

    fn adapter() -> ProductAdapter {
        let sink = SinkClient::new(SinkConfig::new(
            "https://shop.example.com/wp-json/wc/v3".into(),
            "ck".into(),
            "cs".into(),
        ))
        .unwrap();
        ProductAdapter::new(Arc::new(sink))
    }

    fn entity() -> SourceEntity {
        SourceEntity {
            source_id: 42,
            name: "Office Desk".to_string(),
            natural_key: Some("DESK-42".to_string()),
            write_date: None,
            data: serde_json::json!({
                "list_price": 149.5,
                "description": "A desk",
                "active": true,
                "weight": 12.5,
            }),
        }
    }

    #[test]
    fn test_payload_maps_fields() {
        let payload = adapter().payload(&entity());
        assert_eq!(payload["name"], "Office Desk");
        assert_eq!(payload["sku"], "DESK-42");
        assert_eq!(payload["slug"], "office-desk-42");
        assert_eq!(payload["regular_price"], "149.50");
        assert_eq!(payload["status"], "publish");
        assert_eq!(payload["weight"], "12.5");
    }

    #[test]
    fn test_inactive_product_is_draft() {
        let mut entity = entity();
        entity.data["active"] = serde_json::json!(false);
        let payload = adapter().payload(&entity);
        assert_eq!(payload["status"], "draft");
    }

    #[test]
    fn test_payload_includes_references() {
        let payload = adapter()
            .with_categories(vec![10, 11])
            .with_tags(vec![20])
            .payload(&entity());
        assert_eq!(payload["categories"][0]["id"], 10);
        assert_eq!(payload["categories"][1]["id"], 11);
        assert_eq!(payload["tags"][0]["id"], 20);
    }

    #[test]
    fn test_price_fields_override_list_price() {
        let fields = PriceFields {
            regular_price: Some("99.00".to_string()),
            sale_price: Some("89.00".to_string()),
            meta_data: vec![],
        };
        let payload = adapter().with_price_fields(fields).payload(&entity());
        assert_eq!(payload["regular_price"], "99.00");
        assert_eq!(payload["sale_price"], "89.00");
    }
}
