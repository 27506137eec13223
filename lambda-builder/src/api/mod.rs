//! API Module
//!
//! HTTP ingress for the builder. Each submodule handles endpoints for a
//! specific resource.

pub mod builds;
pub mod error;
pub mod events;
pub mod health;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::EventReceiver;

pub type AppState = Arc<EventReceiver>;

/// Create the main API router with all endpoints
pub fn create_router(receiver: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Inbound events
        .route("/events", post(events::receive_event))
        // Build endpoints
        .route(
            "/builds/{request_id}",
            get(builds::get_build).delete(builds::cancel_build),
        )
        // Add state and middleware
        .with_state(receiver)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behaviour, Fixture, SAMPLE_SOURCE};
    use axum::Json;
    use axum::extract::{Path, State};
    use axum::http::{StatusCode, header};
    use axum::response::IntoResponse;
    use lambda_core::dto::event::InboundEvent;
    use std::time::Duration;

    async fn post_event(state: &AppState, event: InboundEvent) -> axum::response::Response {
        match events::receive_event(State(state.clone()), Ok(Json(event))).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_status_codes() {
        let fixture = Fixture::new().await;
        fixture.store.insert("acme/csv-v1.js", SAMPLE_SOURCE);
        let state: AppState = fixture.receiver.clone();

        let accepted = post_event(&state, InboundEvent::build_start("evt-1", "acme", "csv-v1")).await;
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        let duplicate = post_event(&state, InboundEvent::build_start("evt-1", "acme", "csv-v1")).await;
        assert_eq!(duplicate.status(), StatusCode::OK);

        let mut other = InboundEvent::build_start("evt-2", "acme", "csv-v1");
        other.event_type = "lambda.build.delete".to_string();
        assert_eq!(post_event(&state, other).await.status(), StatusCode::NO_CONTENT);

        let invalid = InboundEvent::build_start("evt-3", "acme", "../etc");
        assert_eq!(post_event(&state, invalid).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overloaded_response_carries_retry_after() {
        let fixture = Fixture::idle(1).await;
        let state = fixture.receiver.clone();

        post_event(&state, InboundEvent::build_start("evt-1", "acme", "csv-v1")).await;
        let shed = post_event(&state, InboundEvent::build_start("evt-2", "acme", "json-v2")).await;

        assert_eq!(shed.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(shed.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_lookup_and_cancel() {
        let fixture = Fixture::new().await;
        fixture.store.insert("acme/csv-v1.js", SAMPLE_SOURCE);
        fixture.runtime.script(Behaviour::Hang);
        let state = fixture.receiver.clone();

        let missing = builds::get_build(State(state.clone()), Path("nope".to_string())).await;
        assert!(matches!(missing, Err(error::ApiError::NotFound(_))));

        post_event(&state, InboundEvent::build_start("evt-1", "acme", "csv-v1")).await;
        while fixture.runtime.submitted().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let Json(view) = builds::get_build(State(state.clone()), Path("evt-1".to_string()))
            .await
            .unwrap();
        assert_eq!(view.status, "Building");

        let (status, _) = builds::cancel_build(State(state.clone()), Path("evt-1".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        while !fixture
            .receiver
            .status("evt-1")
            .await
            .unwrap()
            .is_some_and(|job| job.status.is_terminal())
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let again = builds::cancel_build(State(state), Path("evt-1".to_string())).await;
        assert!(matches!(again, Err(error::ApiError::Conflict(_))));
    }
}
