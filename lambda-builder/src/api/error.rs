//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::service::ReceiveError;

/// Seconds a shed sender is asked to wait before redelivering
const RETRY_AFTER_SECS: &str = "5";

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// Build capacity exhausted, retryable
    Overloaded,
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Overloaded => {
                let body = Json(serde_json::json!({ "error": "build queue is full" }));
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
                return response;
            }
            ApiError::Unavailable(msg) => {
                tracing::error!("Builder unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ReceiveError> for ApiError {
    fn from(err: ReceiveError) -> Self {
        match err {
            ReceiveError::Validation(e) => ApiError::BadRequest(e.to_string()),
            ReceiveError::Overloaded => ApiError::Overloaded,
            ReceiveError::Unavailable(msg) => ApiError::Unavailable(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
