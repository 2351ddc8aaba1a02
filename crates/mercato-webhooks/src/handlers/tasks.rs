//! Task status query endpoint.
//!
//! Any worker instance can answer status queries: the task table is the
//! single source of truth, with no process-local state.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use mercato_core::TaskId;
use mercato_db::{TaskRecord, TaskStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiResult, GatewayError};
use crate::router::WebhooksState;

/// Merged task status view, including nested child summaries.
#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    pub tenant_id: Option<Uuid>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub children: Vec<TaskChildSummary>,
}

/// Summary of one child task.
#[derive(Debug, Serialize)]
pub struct TaskChildSummary {
    pub task_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl From<&TaskRecord> for TaskChildSummary {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id,
            task_name: record.task_name.clone(),
            status: record.status,
            duration_ms: record.duration_ms(),
            error_message: record.error_message.clone(),
        }
    }
}

/// `GET /tasks/{task_id}` — status of one task and its children.
pub async fn get_task_status(
    State(state): State<WebhooksState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskStatusResponse>> {
    let id = TaskId::from_uuid(task_id);
    let task = TaskRecord::find_by_task_id(&state.pool, id)
        .await?
        .ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))?;
    let children = TaskRecord::find_children(&state.pool, id).await?;

    Ok(Json(TaskStatusResponse {
        task_id: task.task_id,
        task_name: task.task_name.clone(),
        status: task.status,
        tenant_id: task.tenant_id,
        attempt: task.attempt,
        max_attempts: task.max_attempts,
        duration_ms: task.duration_ms(),
        result: task.result.clone(),
        error_message: task.error_message.clone(),
        created_at: task.created_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        children: children.iter().map(TaskChildSummary::from).collect(),
    }))
}
