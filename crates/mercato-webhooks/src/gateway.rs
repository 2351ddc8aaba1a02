//! Webhook delivery pipeline.
//!
//! Validates, deduplicates and logs inbound deliveries, then hands them
//! to the task dispatcher. Once a delivery is accepted the HTTP answer
//! is always success; downstream failures are visible only through the
//! event's status and the task records.

use mercato_db::{Instance, WebhookEvent, WebhookStatus};
use mercato_engine::jobs::ProcessWebhookArgs;
use mercato_engine::{JobRunner, TaskKind};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crypto::{payload_hash, verify_signature};
use crate::error::GatewayError;

/// How far back the payload hash dedups deliveries whose delivery id
/// changed between retries.
const PAYLOAD_DEDUP_WINDOW_HOURS: i64 = 24;

/// Relevant headers of one delivery.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub signature: Option<String>,
    pub webhook_id: Option<String>,
    pub delivery_id: Option<String>,
    pub topic: Option<String>,
    pub event: Option<String>,
}

/// Acknowledgment returned once a delivery is handled.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl WebhookAck {
    fn ok(message: impl Into<String>, event_id: Option<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
            event_id,
        }
    }

    fn duplicate(message: impl Into<String>, event_id: String) -> Self {
        Self {
            status: "duplicate".to_string(),
            message: message.into(),
            event_id: Some(event_id),
        }
    }
}

/// The webhook gateway service.
pub struct WebhookGateway {
    pool: sqlx::PgPool,
    runner: Arc<JobRunner>,
}

impl WebhookGateway {
    pub fn new(pool: sqlx::PgPool, runner: Arc<JobRunner>) -> Self {
        Self { pool, runner }
    }

    /// Handle one inbound delivery.
    pub async fn handle_delivery(
        &self,
        instance_id: Uuid,
        topic: &str,
        headers: &WebhookHeaders,
        raw_body: &[u8],
    ) -> Result<WebhookAck, GatewayError> {
        let instance = Instance::find_by_id(&self.pool, instance_id)
            .await?
            .ok_or(GatewayError::InstanceNotFound(instance_id))?;
        if !instance.active {
            return Err(GatewayError::InstanceInactive(instance_id));
        }

        // The sink verifies new endpoints with a bare form-encoded ping;
        // acknowledge it without entering the pipeline.
        let body_str = String::from_utf8_lossy(raw_body);
        if body_str.starts_with("webhook_id=") {
            info!(instance_id = %instance_id, topic = topic, "Webhook verification ping received");
            return Ok(WebhookAck::ok(
                "Webhook endpoint verified (ping received)",
                headers.webhook_id.clone(),
            ));
        }

        let payload: Value = serde_json::from_slice(raw_body).map_err(|e| {
            error!(instance_id = %instance_id, topic = topic, error = %e, "Invalid JSON payload");
            GatewayError::MalformedPayload
        })?;

        // Verify the signature when both a secret and a signature are
        // present. A mismatch is rejected outright, never logged as a
        // duplicate.
        match (&instance.webhook_secret, &headers.signature) {
            (Some(secret), Some(signature)) => {
                if !verify_signature(signature, secret, raw_body) {
                    error!(
                        instance_id = %instance_id,
                        delivery_id = ?headers.delivery_id,
                        "Invalid webhook signature"
                    );
                    return Err(GatewayError::InvalidSignature);
                }
            }
            (None, _) => {
                warn!(instance_id = %instance_id, "No webhook secret configured for instance");
            }
            (Some(_), None) => {
                warn!(instance_id = %instance_id, "Delivery carried no signature header");
            }
        }

        let hash = payload_hash(&payload);
        let event_id = resolve_event_id(topic, headers, &payload, &hash);

        // Dedup by event id first, then by recent payload hash for
        // retried deliveries that were re-issued under a new id.
        let existing = WebhookEvent::find_by_event_id(&self.pool, &event_id).await?;
        match dedup_decision(existing.as_ref().map(|e| e.status)) {
            DedupDecision::ReplayCompleted => {
                info!(event_id = %event_id, "Duplicate event, already processed");
                return Ok(WebhookAck::ok("Duplicate event - already processed", Some(event_id)));
            }
            DedupDecision::DuplicateInFlight => {
                info!(event_id = %event_id, "Duplicate event, processing in flight");
                return Ok(WebhookAck::duplicate("Event is being processed", event_id));
            }
            DedupDecision::Resume => {
                WebhookEvent::begin_processing(&self.pool, &event_id).await?;
            }
            DedupDecision::Fresh => {
                if let Some(twin) = WebhookEvent::find_recent_by_payload_hash(
                    &self.pool,
                    instance_id,
                    &hash,
                    PAYLOAD_DEDUP_WINDOW_HOURS,
                )
                .await?
                {
                    if twin.status == WebhookStatus::Completed
                        || twin.status == WebhookStatus::Processing
                    {
                        info!(
                            event_id = %event_id,
                            twin_event_id = %twin.event_id,
                            "Duplicate payload under a different delivery id"
                        );
                        return Ok(WebhookAck::ok(
                            "Duplicate event - already processed",
                            Some(twin.event_id),
                        ));
                    }
                }

                WebhookEvent::create_processing(
                    &self.pool,
                    instance_id,
                    &event_id,
                    topic,
                    &hash,
                    &payload,
                )
                .await?;
            }
        }

        info!(
            instance_id = %instance_id,
            topic = topic,
            topic_header = ?headers.topic,
            event = ?headers.event,
            event_id = %event_id,
            resource_id = ?payload.get("id"),
            "Webhook accepted, queuing for async processing"
        );

        let args = ProcessWebhookArgs {
            event_id: event_id.clone(),
        };
        let enqueue_result = self
            .runner
            .dispatcher()
            .enqueue(
                TaskKind::ProcessWebhook,
                Some(instance_id),
                serde_json::to_value(&args).unwrap_or_default(),
                None,
            )
            .await;

        if let Err(e) = enqueue_result {
            // The event must not be lost: fall back to processing it
            // synchronously on this request.
            error!(event_id = %event_id, error = %e, "Failed to enqueue webhook task, processing synchronously");
            if let Err(run_error) = self.runner.process_webhook(instance_id, &args).await {
                error!(event_id = %event_id, error = %run_error, "Synchronous webhook fallback failed");
                WebhookEvent::fail(&self.pool, &event_id, &run_error.to_string()).await?;
            }
        }

        Ok(WebhookAck::ok(
            "Webhook received and queued for processing",
            Some(event_id),
        ))
    }
}

/// What to do with a delivery given the state of its event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DedupDecision {
    /// Already processed: acknowledge without reprocessing.
    ReplayCompleted,
    /// Another worker is processing it right now: signal a duplicate,
    /// not an error, so the sender does not retry-loop.
    DuplicateInFlight,
    /// A known delivery that never finished: take it over.
    Resume,
    /// First sighting of this delivery.
    Fresh,
}

fn dedup_decision(existing: Option<WebhookStatus>) -> DedupDecision {
    match existing {
        Some(WebhookStatus::Completed) => DedupDecision::ReplayCompleted,
        Some(WebhookStatus::Processing) => DedupDecision::DuplicateInFlight,
        Some(WebhookStatus::Pending | WebhookStatus::Failed) => DedupDecision::Resume,
        None => DedupDecision::Fresh,
    }
}

/// Resolve the delivery's idempotency key.
///
/// Prefers the delivery header; falls back to a synthetic id derived
/// from the topic, the resource id and a prefix of the payload hash.
fn resolve_event_id(
    topic: &str,
    headers: &WebhookHeaders,
    payload: &Value,
    hash: &str,
) -> String {
    if let Some(delivery_id) = headers.delivery_id.as_deref().filter(|id| !id.is_empty()) {
        return delivery_id.to_string();
    }
    let resource_id = payload
        .get("id")
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    let prefix = &hash[..hash.len().min(8)];
    format!("{topic}_{resource_id}_{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_prefers_delivery_header() {
        let headers = WebhookHeaders {
            delivery_id: Some("delivery-123".to_string()),
            ..Default::default()
        };
        let id = resolve_event_id("product.updated", &headers, &json!({"id": 5}), "abcdef1234");
        assert_eq!(id, "delivery-123");
    }

    #[test]
    fn test_event_id_fallback_shape() {
        let headers = WebhookHeaders::default();
        let id = resolve_event_id("product.updated", &headers, &json!({"id": 5}), "abcdef1234");
        assert_eq!(id, "product.updated_5_abcdef12");
    }

    #[test]
    fn test_event_id_fallback_without_resource_id() {
        let headers = WebhookHeaders {
            delivery_id: Some(String::new()),
            ..Default::default()
        };
        let id = resolve_event_id("order.created", &headers, &json!({}), "abcdef1234");
        assert_eq!(id, "order.created_unknown_abcdef12");
    }

    #[test]
    fn test_replay_of_completed_event_is_not_reprocessed() {
        assert_eq!(
            dedup_decision(Some(WebhookStatus::Completed)),
            DedupDecision::ReplayCompleted
        );
    }

    #[test]
    fn test_in_flight_event_signals_duplicate() {
        assert_eq!(
            dedup_decision(Some(WebhookStatus::Processing)),
            DedupDecision::DuplicateInFlight
        );
    }

    #[test]
    fn test_failed_and_pending_events_are_resumed() {
        assert_eq!(
            dedup_decision(Some(WebhookStatus::Failed)),
            DedupDecision::Resume
        );
        assert_eq!(
            dedup_decision(Some(WebhookStatus::Pending)),
            DedupDecision::Resume
        );
    }

    #[test]
    fn test_unknown_event_is_fresh() {
        assert_eq!(dedup_decision(None), DedupDecision::Fresh);
    }

    #[test]
    fn test_ack_serialization_skips_missing_event_id() {
        let ack = WebhookAck::ok("pong", None);
        let value = serde_json::to_value(&ack).unwrap();
        assert!(value.get("event_id").is_none());
        assert_eq!(value["status"], "ok");
    }
}
