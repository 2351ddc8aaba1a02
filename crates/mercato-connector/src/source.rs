//! Source system client.
//!
//! JSON-RPC client for the authoritative system of record. The protocol
//! is session-based: `authenticate` yields a numeric user id which is
//! passed on every subsequent `execute_kw` call. The session id is
//! cached and refreshed once on expiry.
//!
//! The engine consumes this as a typed key-value document source via
//! `search_read`/`create`/`write`; it does not own the protocol.

use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{ConnectorError, ConnectorResult};

/// Connection settings for the source system.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Base URL of the JSON-RPC endpoint.
    pub url: String,
    /// Database name.
    pub db: String,
    /// Login user.
    pub username: String,
    /// API key or password.
    pub api_key: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl SourceConfig {
    /// Config with the default timeout.
    #[must_use]
    pub fn new(url: String, db: String, username: String, api_key: String) -> Self {
        Self {
            url,
            db,
            username,
            api_key,
            timeout_secs: 60,
        }
    }
}

/// JSON-RPC client for the source system.
pub struct SourceClient {
    config: SourceConfig,
    client: Client,
    /// Cached authenticated user id.
    uid: Arc<RwLock<Option<i64>>>,
}

impl std::fmt::Debug for SourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceClient")
            .field("url", &self.config.url)
            .field("db", &self.config.db)
            .field("username", &self.config.username)
            .finish()
    }
}

impl SourceClient {
    /// Create a new client. Fails on invalid timeout configuration only.
    pub fn new(config: SourceConfig) -> ConnectorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConnectorError::Validation {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            config,
            client,
            uid: Arc::new(RwLock::new(None)),
        })
    }

    /// Authenticate and return the session user id, caching it.
    pub async fn authenticate(&self) -> ConnectorResult<i64> {
        {
            let cached = self.uid.read().await;
            if let Some(uid) = *cached {
                return Ok(uid);
            }
        }

        let result = self
            .call(
                "common",
                "authenticate",
                json!([
                    self.config.db,
                    self.config.username,
                    self.config.api_key,
                    {}
                ]),
            )
            .await?;

        let uid = result.as_i64().filter(|uid| *uid > 0).ok_or_else(|| {
            ConnectorError::Authentication {
                message: format!(
                    "Source rejected credentials for user {}",
                    self.config.username
                ),
            }
        })?;

        *self.uid.write().await = Some(uid);
        debug!(uid = uid, "Source session established");
        Ok(uid)
    }

    /// Read records matching a domain filter.
    #[instrument(skip(self, domain, fields), fields(model = model))]
    pub async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> ConnectorResult<Vec<Value>> {
        let mut kwargs = json!({ "fields": fields });
        if let Some(limit) = limit {
            kwargs["limit"] = json!(limit);
        }
        if let Some(offset) = offset {
            kwargs["offset"] = json!(offset);
        }

        let result = self
            .execute_kw(model, "search_read", json!([domain]), kwargs)
            .await?;

        result
            .as_array()
            .cloned()
            .ok_or_else(|| ConnectorError::Protocol {
                message: format!("search_read on {model} returned a non-array result"),
            })
    }

    /// Count records matching a domain filter.
    pub async fn search_count(&self, model: &str, domain: Value) -> ConnectorResult<i64> {
        let result = self
            .execute_kw(model, "search_count", json!([domain]), json!({}))
            .await?;
        result.as_i64().ok_or_else(|| ConnectorError::Protocol {
            message: format!("search_count on {model} returned a non-integer result"),
        })
    }

    /// Create a record, returning its id.
    pub async fn create(&self, model: &str, values: Value) -> ConnectorResult<i64> {
        let result = self
            .execute_kw(model, "create", json!([values]), json!({}))
            .await?;
        result.as_i64().ok_or_else(|| ConnectorError::Protocol {
            message: format!("create on {model} returned a non-integer id"),
        })
    }

    /// Write values onto existing records.
    pub async fn write(&self, model: &str, ids: &[i64], values: Value) -> ConnectorResult<bool> {
        let result = self
            .execute_kw(model, "write", json!([ids, values]), json!({}))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Invoke a model method through the object service, re-authenticating
    /// once if the session has expired.
    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> ConnectorResult<Value> {
        let uid = self.authenticate().await?;
        let call_args = json!([
            self.config.db,
            uid,
            self.config.api_key,
            model,
            method,
            args,
            kwargs
        ]);

        match self.call("object", "execute_kw", call_args.clone()).await {
            Err(ConnectorError::Authentication { .. }) => {
                warn!(model = model, method = method, "Source session expired, re-authenticating");
                *self.uid.write().await = None;
                let uid = self.authenticate().await?;
                let mut retry_args = call_args;
                retry_args[1] = json!(uid);
                self.call("object", "execute_kw", retry_args).await
            }
            other => other,
        }
    }

    /// Perform one raw JSON-RPC call.
    async fn call(&self, service: &str, method: &str, args: Value) -> ConnectorResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args,
            },
            "id": 1,
        });

        let response = self
            .client
            .post(format!("{}/jsonrpc", self.config.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConnectorError::from_status(status.as_u16(), &text));
        }

        let envelope: Value = response.json().await?;
        if let Some(error) = envelope.get("error") {
            return Err(classify_rpc_error(error));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Map a JSON-RPC error object onto the connector taxonomy.
fn classify_rpc_error(error: &Value) -> ConnectorError {
    let message = error
        .get("data")
        .and_then(|d| d.get("message"))
        .or_else(|| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown RPC error")
        .to_string();

    let name = error
        .get("data")
        .and_then(|d| d.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if name.contains("AccessDenied") || name.contains("AccessError") || name.contains("SessionExpired")
    {
        ConnectorError::Authentication { message }
    } else {
        ConnectorError::Validation { message }
    }
}

/// Normalize a raw source record for the engine.
///
/// The source wire format uses `false` for absent scalar fields and
/// `[id, name]` pairs for many-to-one references. This flattens:
/// - `false` → `null`
/// - `categ_id: [id, name]` → `categ_id: id` plus `categ_name: name`
/// - other 2-element `[int, string]` pairs → the id
/// - many-to-many id lists pass through untouched
#[must_use]
pub fn normalize_record(record: &Value) -> Value {
    let Some(map) = record.as_object() else {
        return record.clone();
    };

    let mut out = serde_json::Map::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Bool(false) => {
                out.insert(key.clone(), Value::Null);
            }
            Value::Array(items) if is_many2one(items) => {
                out.insert(key.clone(), items[0].clone());
                if key == "categ_id" {
                    out.insert("categ_name".to_string(), items[1].clone());
                }
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    Value::Object(out)
}

fn is_many2one(items: &[Value]) -> bool {
    items.len() == 2 && items[0].is_i64() && items[1].is_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_false_to_null() {
        let raw = json!({"default_code": false, "name": "Desk"});
        let normalized = normalize_record(&raw);
        assert_eq!(normalized["default_code"], Value::Null);
        assert_eq!(normalized["name"], json!("Desk"));
    }

    #[test]
    fn test_normalize_category_pair() {
        let raw = json!({"categ_id": [7, "All / Office"]});
        let normalized = normalize_record(&raw);
        assert_eq!(normalized["categ_id"], json!(7));
        assert_eq!(normalized["categ_name"], json!("All / Office"));
    }

    #[test]
    fn test_normalize_other_many2one_keeps_id_only() {
        let raw = json!({"uom_id": [1, "Units"]});
        let normalized = normalize_record(&raw);
        assert_eq!(normalized["uom_id"], json!(1));
        assert!(normalized.get("uom_name").is_none());
    }

    #[test]
    fn test_normalize_many2many_passthrough() {
        let raw = json!({"product_tag_ids": [3, 5, 9]});
        let normalized = normalize_record(&raw);
        assert_eq!(normalized["product_tag_ids"], json!([3, 5, 9]));
    }

    #[test]
    fn test_classify_rpc_access_denied() {
        let error = json!({
            "message": "RPC Server Error",
            "data": {"name": "erp.exceptions.AccessDenied", "message": "Access Denied"}
        });
        assert!(matches!(
            classify_rpc_error(&error),
            ConnectorError::Authentication { .. }
        ));
    }

    #[test]
    fn test_classify_rpc_validation() {
        let error = json!({
            "message": "RPC Server Error",
            "data": {"name": "erp.exceptions.ValidationError", "message": "Bad value"}
        });
        assert!(matches!(
            classify_rpc_error(&error),
            ConnectorError::Validation { .. }
        ));
    }
}
