//! Category adapter.

use async_trait::async_trait;
use mercato_core::EntityKind;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::reconciler::{EntityAdapter, SourceEntity};
use mercato_connector::sink::paths;
use mercato_connector::{ConnectorError, SinkClient};

/// Reconciles categories into the sink.
///
/// The parent's sink id must already be resolved when this adapter is
/// built; the hierarchy resolver guarantees that by reconciling chains
/// root-first.
pub struct CategoryAdapter {
    sink: Arc<SinkClient>,
    parent_sink_id: Option<i64>,
}

impl CategoryAdapter {
    #[must_use]
    pub fn new(sink: Arc<SinkClient>) -> Self {
        Self {
            sink,
            parent_sink_id: None,
        }
    }

    /// Sink id of the already-reconciled parent category.
    #[must_use]
    pub fn with_parent(mut self, parent_sink_id: Option<i64>) -> Self {
        self.parent_sink_id = parent_sink_id;
        self
    }

    fn payload(&self, entity: &SourceEntity) -> Value {
        let mut payload = serde_json::Map::new();
        payload.insert("name".to_string(), json!(entity.name));
        if let Some(parent) = self.parent_sink_id {
            payload.insert("parent".to_string(), json!(parent));
        }
        Value::Object(payload)
    }
}

#[async_trait]
impl EntityAdapter for CategoryAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Category
    }

    async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError> {
        self.sink.fetch(paths::CATEGORIES, sink_id).await
    }

    async fn fetch_by_natural_key(
        &self,
        entity: &SourceEntity,
    ) -> Result<Option<Value>, ConnectorError> {
        self.sink.find_by_name(paths::CATEGORIES, &entity.name).await
    }

    async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError> {
        self.sink.post(paths::CATEGORIES, &self.payload(entity)).await
    }

    async fn update(
        &self,
        sink_id: i64,
        entity: &SourceEntity,
    ) -> Result<Value, ConnectorError> {
        self.sink
            .put(
                &format!("{}/{sink_id}", paths::CATEGORIES),
                &self.payload(entity),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercato_connector::SinkConfig;

    fn adapter() -> CategoryAdapter {
        let sink = SinkClient::new(SinkConfig::new(
            "https://shop.example.com/wp-json/wc/v3".into(),
            "ck".into(),
            "cs".into(),
        ))
        .unwrap();
        CategoryAdapter::new(Arc::new(sink))
    }

    fn entity(name: &str) -> SourceEntity {
        SourceEntity {
            source_id: 7,
            name: name.to_string(),
            natural_key: Some(name.to_string()),
            write_date: None,
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn test_payload_without_parent() {
        let payload = adapter().payload(&entity("Office"));
        assert_eq!(payload["name"], "Office");
        assert!(payload.get("parent").is_none());
    }

    #[test]
    fn test_payload_with_parent() {
        let payload = adapter().with_parent(Some(31)).payload(&entity("Chairs"));
        assert_eq!(payload["parent"], 31);
    }
}
