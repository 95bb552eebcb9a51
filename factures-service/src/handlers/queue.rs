use crate::dtos::ApiResponse;
use crate::middleware::AuthUser;
use crate::startup::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

/// Pending journal size for the caller.
pub async fn pending_count(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let pending = state.queue.count(user.id).await?;
    Ok(Json(ApiResponse::ok(json!({ "pending": pending }))))
}

/// Replay the caller's journal now.
pub async fn replay_queue(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let report = state.sync.replay_user(user.id).await?;
    Ok(Json(ApiResponse::ok(report)))
}
