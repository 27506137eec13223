//! Build API Handlers
//!
//! Lookup and cancellation of recorded builds.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use lambda_core::dto::build::BuildView;

use super::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::CancelOutcome;

/// GET /builds/{request_id}
pub async fn get_build(
    State(receiver): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<BuildView>> {
    tracing::debug!("Getting build: {}", request_id);

    let job = receiver
        .status(&request_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Build {} not found", request_id)))?;

    Ok(Json(BuildView::from(&job)))
}

/// DELETE /builds/{request_id}
/// Cancel a build that has not finished
pub async fn cancel_build(
    State(receiver): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<(StatusCode, Json<BuildView>)> {
    tracing::info!("Cancelling build: {}", request_id);

    match receiver.cancel(&request_id).await? {
        CancelOutcome::Requested(job) => Ok((StatusCode::ACCEPTED, Json(BuildView::from(&job)))),
        CancelOutcome::AlreadyFinished(job) => Err(ApiError::Conflict(format!(
            "Build {} already {}",
            request_id, job.status
        ))),
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!(
            "Build {} not found",
            request_id
        ))),
    }
}
