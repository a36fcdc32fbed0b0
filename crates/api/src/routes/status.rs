//! Status callback for out-of-process reporters.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::{Channel, NotificationStatus, StatusEvent, StatusUpdate};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/{channel}/status", post(report_status))
}

/// POST /api/v1/{channel}/status: append a reporter's status event.
///
/// The notification does not have to be known to this process; the status log
/// accepts events for any id. `pending` is written only by the enqueue gateway and
/// is rejected here. A repeated `delivered` returns the existing event unchanged.
async fn report_status(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<StatusEvent>, AppError> {
    let channel: Channel = channel.parse().map_err(AppError::Validation)?;
    if update.notification_id.trim().is_empty() {
        return Err(AppError::Validation(
            "notification_id must not be empty".to_string(),
        ));
    }

    if update.status == NotificationStatus::Pending {
        return Err(AppError::Validation(
            "pending is recorded at enqueue time and cannot be reported".to_string(),
        ));
    }

    if update.status == NotificationStatus::Delivered
        && let Some(existing) = state
            .store
            .history(&update.notification_id)
            .await?
            .into_iter()
            .find(|e| e.status == NotificationStatus::Delivered)
    {
        tracing::debug!(
            notification_id = %existing.notification_id,
            %channel,
            "Notification already delivered, ignoring report"
        );
        return Ok(Json(existing));
    }

    let event = state
        .store
        .append_status(&update.notification_id, update.status, update.error.as_deref())
        .await?;

    tracing::info!(
        notification_id = %event.notification_id,
        %channel,
        status = %event.status,
        retry_count = event.retry_count,
        "Status reported"
    );
    Ok(Json(event))
}
