//! Webhook receive and health endpoints.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use mercato_db::Instance;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiResult, GatewayError};
use crate::gateway::{WebhookAck, WebhookHeaders};
use crate::router::WebhooksState;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

/// `POST /webhooks/{instance_id}/{topic}` — receive one delivery.
pub async fn receive_webhook(
    State(state): State<WebhooksState>,
    Path((instance_id, topic)): Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let webhook_headers = WebhookHeaders {
        signature: header(&headers, "X-Webhook-Signature"),
        webhook_id: header(&headers, "X-Webhook-Id"),
        delivery_id: header(&headers, "X-Webhook-Delivery-Id"),
        topic: header(&headers, "X-Webhook-Topic"),
        event: header(&headers, "X-Webhook-Event"),
    };

    let ack = state
        .gateway
        .handle_delivery(instance_id, &topic, &webhook_headers, &body)
        .await?;
    Ok(Json(ack))
}

/// `GET /webhooks/{instance_id}/health` — readiness probe for the sink's
/// endpoint verification.
pub async fn webhook_health(
    State(state): State<WebhooksState>,
    Path(instance_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let instance = Instance::find_by_id(&state.pool, instance_id)
        .await?
        .ok_or(GatewayError::InstanceNotFound(instance_id))?;

    Ok(Json(json!({
        "status": "ok",
        "instance_id": instance.id,
        "instance_name": instance.name,
        "is_active": instance.active,
        "message": "Webhook receiver is ready",
    })))
}
