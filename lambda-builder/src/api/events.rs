//! Event ingress endpoint

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use lambda_core::dto::build::{BuildView, ReceiptKind, ReceiptView};
use lambda_core::dto::event::InboundEvent;

use super::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::Receipt;

/// POST /events
/// Accepts a CloudEvent; answers before the build runs
///
/// 202 for a new build, 200 for a redelivered id, 204 for an event type
/// this service does not handle.
pub async fn receive_event(
    State(receiver): State<AppState>,
    payload: Result<Json<InboundEvent>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(event) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    tracing::debug!("Received event {} of type {}", event.id, event.event_type);

    let (status, kind, job) = match receiver.receive(event).await? {
        Receipt::Accepted(job, _) => (StatusCode::ACCEPTED, ReceiptKind::Accepted, job),
        Receipt::Queued(job, _) => (StatusCode::ACCEPTED, ReceiptKind::Queued, job),
        Receipt::Duplicate(job, _) => (StatusCode::OK, ReceiptKind::Duplicate, job),
        Receipt::Ignored { .. } => return Ok(StatusCode::NO_CONTENT.into_response()),
    };

    let view = ReceiptView {
        receipt: kind,
        build: BuildView::from(&job),
    };
    Ok((status, Json(view)).into_response())
}
