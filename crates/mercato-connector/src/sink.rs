//! Sink system client.
//!
//! Generic REST client for the storefront API, authenticated with
//! consumer key/secret over basic auth. The engine treats responses as
//! opaque JSON documents whose identity surface is `id`/`slug`/`sku`.

use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{ConnectorError, ConnectorResult};

/// Connection settings for the sink system.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// REST base URL, up to and including the API version prefix.
    pub url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl SinkConfig {
    /// Config with the default timeout.
    #[must_use]
    pub fn new(url: String, consumer_key: String, consumer_secret: String) -> Self {
        Self {
            url,
            consumer_key,
            consumer_secret,
            timeout_secs: 60,
        }
    }
}

/// REST client for the sink system.
pub struct SinkClient {
    config: SinkConfig,
    client: Client,
}

impl std::fmt::Debug for SinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkClient")
            .field("url", &self.config.url)
            .finish()
    }
}

impl SinkClient {
    /// Create a new client.
    pub fn new(config: SinkConfig) -> ConnectorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConnectorError::Validation {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    /// GET a path with optional query parameters.
    #[instrument(skip(self, query))]
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> ConnectorResult<Value> {
        self.request(Method::GET, path, query, None).await
    }

    /// POST a JSON body to a path.
    #[instrument(skip(self, body))]
    pub async fn post(&self, path: &str, body: &Value) -> ConnectorResult<Value> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// PUT a JSON body to a path.
    #[instrument(skip(self, body))]
    pub async fn put(&self, path: &str, body: &Value) -> ConnectorResult<Value> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    /// DELETE a path.
    #[instrument(skip(self))]
    pub async fn delete(&self, path: &str, force: bool) -> ConnectorResult<Value> {
        let query = if force {
            vec![("force", "true".to_string())]
        } else {
            Vec::new()
        };
        self.request(Method::DELETE, path, &query, None).await
    }

    /// Fetch one document by id; `Ok(None)` when the sink has no such id.
    pub async fn fetch(&self, collection: &str, id: i64) -> ConnectorResult<Option<Value>> {
        match self.get(&format!("{collection}/{id}"), &[]).await {
            Ok(doc) => Ok(Some(doc)),
            Err(ConnectorError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Search products by SKU, validating the exact match.
    ///
    /// The sink's search is fuzzy and may return a near-miss; trusting it
    /// would map one source product onto another product's sink identity,
    /// so only a document whose `sku` field equals the query is returned.
    pub async fn find_product_by_sku(&self, sku: &str) -> ConnectorResult<Option<Value>> {
        if sku.is_empty() {
            return Ok(None);
        }
        let result = self
            .get(
                "products",
                &[("sku", sku.to_string()), ("per_page", "1".to_string())],
            )
            .await?;
        let hit = result.as_array().and_then(|items| items.first()).cloned();
        Ok(hit.filter(|doc| doc.get("sku").and_then(Value::as_str) == Some(sku)))
    }

    /// Search a collection by slug.
    pub async fn find_by_slug(&self, collection: &str, slug: &str) -> ConnectorResult<Option<Value>> {
        if slug.is_empty() {
            return Ok(None);
        }
        let result = self
            .get(
                collection,
                &[("slug", slug.to_string()), ("per_page", "1".to_string())],
            )
            .await?;
        Ok(result.as_array().and_then(|items| items.first()).cloned())
    }

    /// Search a collection by exact name, scanning one page of matches.
    pub async fn find_by_name(&self, collection: &str, name: &str) -> ConnectorResult<Option<Value>> {
        if name.is_empty() {
            return Ok(None);
        }
        let result = self
            .get(
                collection,
                &[("search", name.to_string()), ("per_page", "20".to_string())],
            )
            .await?;
        let hit = result.as_array().and_then(|items| {
            items
                .iter()
                .find(|doc| doc.get("name").and_then(Value::as_str) == Some(name))
                .cloned()
        });
        Ok(hit)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> ConnectorResult<Value> {
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), path);
        debug!(method = %method, path = path, "Sink request");

        let mut builder = self
            .client
            .request(method, &url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret));
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConnectorError::from_status(status.as_u16(), &text));
        }

        Ok(response.json().await?)
    }
}

/// Sink collection paths used by the engine.
pub mod paths {
    pub const PRODUCTS: &str = "products";
    pub const CATEGORIES: &str = "products/categories";
    pub const TAGS: &str = "products/tags";
    pub const ATTRIBUTES: &str = "products/attributes";
    pub const WEBHOOKS: &str = "webhooks";

    /// Terms collection of one attribute.
    #[must_use]
    pub fn attribute_terms(attribute_id: i64) -> String {
        format!("products/attributes/{attribute_id}/terms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_terms_path() {
        assert_eq!(paths::attribute_terms(12), "products/attributes/12/terms");
    }

    #[test]
    fn test_config_default_timeout() {
        let config = SinkConfig::new(
            "https://shop.example.com/wp-json/wc/v3".into(),
            "ck".into(),
            "cs".into(),
        );
        assert_eq!(config.timeout_secs, 60);
    }
}
