//! Axum router for the webhook gateway and task status API.

use axum::routing::{get, post};
use axum::Router;
use mercato_engine::JobRunner;
use std::sync::Arc;

use crate::gateway::WebhookGateway;
use crate::handlers::receive::{receive_webhook, webhook_health};
use crate::handlers::tasks::get_task_status;

/// Shared state of the webhook API.
#[derive(Clone)]
pub struct WebhooksState {
    pub pool: sqlx::PgPool,
    pub gateway: Arc<WebhookGateway>,
}

impl WebhooksState {
    pub fn new(pool: sqlx::PgPool, runner: Arc<JobRunner>) -> Self {
        let gateway = Arc::new(WebhookGateway::new(pool.clone(), runner));
        Self { pool, gateway }
    }
}

/// Build the webhook router.
pub fn webhooks_router(state: WebhooksState) -> Router {
    Router::new()
        .route("/webhooks/{instance_id}/{topic}", post(receive_webhook))
        .route("/webhooks/{instance_id}/health", get(webhook_health))
        .route("/tasks/{task_id}", get(get_task_status))
        .with_state(state)
}
