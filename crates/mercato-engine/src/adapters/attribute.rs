//! Attribute and attribute-value adapters.
//!
//! Attribute values live under their attribute's terms collection in
//! the sink, so the value adapter needs the parent attribute's resolved
//! sink id before it can address anything.

use async_trait::async_trait;
use mercato_core::EntityKind;
use serde_json::{json, Value};
use std::sync::Arc;

use super::slugify;
use crate::reconciler::{EntityAdapter, SourceEntity};
use mercato_connector::sink::paths;
use mercato_connector::{ConnectorError, SinkClient};

/// Reconciles product attributes into the sink.
pub struct AttributeAdapter {
    sink: Arc<SinkClient>,
}

impl AttributeAdapter {
    #[must_use]
    pub fn new(sink: Arc<SinkClient>) -> Self {
        Self { sink }
    }

    fn payload(entity: &SourceEntity) -> Value {
        json!({
            "name": entity.name,
            "slug": format!("pa_{}", slugify(&entity.name)),
            "type": "select",
        })
    }
}

#[async_trait]
impl EntityAdapter for AttributeAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Attribute
    }

    async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError> {
        self.sink.fetch(paths::ATTRIBUTES, sink_id).await
    }

    async fn fetch_by_natural_key(
        &self,
        entity: &SourceEntity,
    ) -> Result<Option<Value>, ConnectorError> {
        // The attributes collection is small and unpaginated in
        // practice; scan it for an exact name match.
        let all = self.sink.get(paths::ATTRIBUTES, &[]).await?;
        Ok(all.as_array().and_then(|items| {
            items
                .iter()
                .find(|doc| doc.get("name").and_then(Value::as_str) == Some(entity.name.as_str()))
                .cloned()
        }))
    }

    async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError> {
        self.sink.post(paths::ATTRIBUTES, &Self::payload(entity)).await
    }

    async fn update(
        &self,
        sink_id: i64,
        entity: &SourceEntity,
    ) -> Result<Value, ConnectorError> {
        self.sink
            .put(
                &format!("{}/{sink_id}", paths::ATTRIBUTES),
                &Self::payload(entity),
            )
            .await
    }
}

/// Reconciles the values (terms) of one attribute into the sink.
pub struct AttributeValueAdapter {
    sink: Arc<SinkClient>,
    /// Sink id of the owning attribute, already reconciled.
    attribute_sink_id: i64,
}

impl AttributeValueAdapter {
    #[must_use]
    pub fn new(sink: Arc<SinkClient>, attribute_sink_id: i64) -> Self {
        Self {
            sink,
            attribute_sink_id,
        }
    }

    fn collection(&self) -> String {
        paths::attribute_terms(self.attribute_sink_id)
    }
}

#[async_trait]
impl EntityAdapter for AttributeValueAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::AttributeValue
    }

    async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError> {
        self.sink.fetch(&self.collection(), sink_id).await
    }

    async fn fetch_by_natural_key(
        &self,
        entity: &SourceEntity,
    ) -> Result<Option<Value>, ConnectorError> {
        self.sink.find_by_name(&self.collection(), &entity.name).await
    }

    async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError> {
        self.sink
            .post(&self.collection(), &json!({"name": entity.name}))
            .await
    }

    async fn update(
        &self,
        sink_id: i64,
        entity: &SourceEntity,
    ) -> Result<Value, ConnectorError> {
        self.sink
            .put(
                &format!("{}/{sink_id}", self.collection()),
                &json!({"name": entity.name}),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_payload_slug() {
        let entity = SourceEntity {
            source_id: 3,
            name: "Frame Color".to_string(),
            natural_key: None,
            write_date: None,
            data: json!({}),
        };
        let payload = AttributeAdapter::payload(&entity);
        assert_eq!(payload["slug"], "pa_frame-color");
        assert_eq!(payload["type"], "select");
    }
}
