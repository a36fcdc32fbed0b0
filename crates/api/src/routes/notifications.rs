//! Enqueue and status query routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::{
    CreateNotificationRequest, EnqueueReceipt, NotificationStatus, StatusEvent,
};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/notifications", post(create_notification))
        .route("/api/v1/notifications/{id}/status", get(latest_status))
        .route("/api/v1/notifications/{id}/history", get(status_history))
}

/// Latest lifecycle state of one notification.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: i32,
}

impl From<StatusEvent> for StatusView {
    fn from(event: StatusEvent) -> Self {
        Self {
            notification_id: event.notification_id,
            status: event.status,
            timestamp: event.timestamp,
            error: event.error,
            retry_count: event.retry_count,
        }
    }
}

/// POST /api/v1/notifications: accept a notification for asynchronous delivery.
///
/// 202 for a newly accepted request, 200 for an idempotent replay.
async fn create_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<EnqueueReceipt>), AppError> {
    let receipt = state.gateway.create(&auth.user_id, &request).await?;
    let status = if receipt.idempotent {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(receipt)))
}

/// GET /api/v1/notifications/{id}/status
async fn latest_status(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<StatusView>, AppError> {
    let latest = state
        .store
        .latest_status(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
    Ok(Json(latest.into()))
}

/// GET /api/v1/notifications/{id}/history: every status event, oldest first.
async fn status_history(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<StatusEvent>>, AppError> {
    let history = state.store.history(&id).await?;
    if history.is_empty() {
        return Err(AppError::NotFound(format!("Notification {} not found", id)));
    }
    Ok(Json(history))
}
