//! Fire-and-forget alerting.
//!
//! The engine notifies an external alerting collaborator on terminal
//! task failures and on sync-completion summaries. Delivery is best
//! effort: the pipeline never blocks on, or depends on the success of,
//! this interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One alert payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub tenant_id: Option<Uuid>,
    /// Free-form context (task name, attempt counts, batch counters).
    pub context: Value,
}

impl Alert {
    /// Alert for a task that exhausted its retries.
    #[must_use]
    pub fn task_failure(
        task_name: &str,
        error: &str,
        tenant_id: Option<Uuid>,
        attempt: i32,
        max_attempts: i32,
    ) -> Self {
        Self {
            severity: AlertSeverity::Error,
            title: format!("Task failed: {task_name}"),
            message: error.to_string(),
            tenant_id,
            context: serde_json::json!({
                "task_name": task_name,
                "attempt": attempt,
                "max_attempts": max_attempts,
            }),
        }
    }

    /// Summary alert after a bulk sync run.
    #[must_use]
    pub fn sync_completed(tenant_id: Uuid, summary: &crate::reconciler::SyncBatchSummary) -> Self {
        let severity = if summary.errors > 0 {
            AlertSeverity::Warning
        } else {
            AlertSeverity::Info
        };
        Self {
            severity,
            title: "Sync completed".to_string(),
            message: format!(
                "{} processed: {} created, {} updated, {} skipped, {} errors",
                summary.total, summary.created, summary.updated, summary.skipped, summary.errors
            ),
            tenant_id: Some(tenant_id),
            context: serde_json::to_value(summary).unwrap_or(Value::Null),
        }
    }
}

/// Alert delivery channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Failures are logged by the implementation and
    /// never propagated.
    async fn send(&self, alert: Alert);
}

/// Discards alerts. Default when no channel is configured.
#[derive(Debug, Default)]
pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn send(&self, alert: Alert) {
        debug!(title = %alert.title, "Alert dropped (no sink configured)");
    }
}

/// Posts alerts as JSON to a configured webhook URL.
pub struct HttpAlertSink {
    url: String,
    client: reqwest::Client,
}

impl HttpAlertSink {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn send(&self, alert: Alert) {
        let result = self.client.post(&self.url).json(&alert).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(title = %alert.title, "Alert delivered");
            }
            Ok(response) => {
                warn!(
                    title = %alert.title,
                    status = response.status().as_u16(),
                    "Alert endpoint rejected the alert"
                );
            }
            Err(e) => {
                warn!(title = %alert.title, error = %e, "Alert delivery failed");
            }
        }
    }
}

/// Dispatch an alert without waiting for delivery.
pub fn notify(sink: &Arc<dyn AlertSink>, alert: Alert) {
    let sink = sink.clone();
    tokio::spawn(async move {
        sink.send(alert).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failure_alert_shape() {
        let alert = Alert::task_failure("sync_product", "boom", None, 3, 3);
        assert_eq!(alert.severity, AlertSeverity::Error);
        assert!(alert.title.contains("sync_product"));
        assert_eq!(alert.context["attempt"], 3);
    }

    #[test]
    fn test_sync_summary_severity() {
        let mut summary = crate::reconciler::SyncBatchSummary::default();
        let clean = Alert::sync_completed(Uuid::new_v4(), &summary);
        assert_eq!(clean.severity, AlertSeverity::Info);

        summary.errors = 1;
        summary.total = 1;
        let dirty = Alert::sync_completed(Uuid::new_v4(), &summary);
        assert_eq!(dirty.severity, AlertSeverity::Warning);
        assert!(dirty.message.contains("1 errors"));
    }
}
