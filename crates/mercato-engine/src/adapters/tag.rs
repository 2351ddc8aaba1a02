//! Tag adapter.

use async_trait::async_trait;
use mercato_core::EntityKind;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::reconciler::{EntityAdapter, SourceEntity};
use mercato_connector::sink::paths;
use mercato_connector::{ConnectorError, SinkClient};

/// Reconciles product tags into the sink. Tags carry nothing but a name.
pub struct TagAdapter {
    sink: Arc<SinkClient>,
}

impl TagAdapter {
    #[must_use]
    pub fn new(sink: Arc<SinkClient>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EntityAdapter for TagAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Tag
    }

    async fn fetch_by_id(&self, sink_id: i64) -> Result<Option<Value>, ConnectorError> {
        self.sink.fetch(paths::TAGS, sink_id).await
    }

    async fn fetch_by_natural_key(
        &self,
        entity: &SourceEntity,
    ) -> Result<Option<Value>, ConnectorError> {
        self.sink.find_by_name(paths::TAGS, &entity.name).await
    }

    async fn create(&self, entity: &SourceEntity) -> Result<Value, ConnectorError> {
        self.sink
            .post(paths::TAGS, &json!({"name": entity.name}))
            .await
    }

    async fn update(
        &self,
        sink_id: i64,
        entity: &SourceEntity,
    ) -> Result<Value, ConnectorError> {
        self.sink
            .put(
                &format!("{}/{sink_id}", paths::TAGS),
                &json!({"name": entity.name}),
            )
            .await
    }
}
