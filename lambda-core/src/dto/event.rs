//! Inbound event DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::build::{BuildKey, BuildRequest};
use crate::domain::error::ValidationError;

/// Type identifier of the event that starts a build
pub const BUILD_START_EVENT_TYPE: &str = "lambda.build.start";

/// Maximum accepted event id length
pub const MAX_EVENT_ID_LENGTH: usize = 256;

/// CloudEvent-style notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub specversion: Option<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Event types the receiver understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    BuildStart,
    Unrecognized(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            BUILD_START_EVENT_TYPE => EventKind::BuildStart,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }
}

/// Payload of a build-start event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStartPayload {
    pub tenant_id: String,
    pub parser_id: String,
}

impl InboundEvent {
    pub fn build_start(id: impl Into<String>, tenant_id: &str, parser_id: &str) -> Self {
        Self {
            specversion: Some("1.0".to_string()),
            id: id.into(),
            event_type: BUILD_START_EVENT_TYPE.to_string(),
            source: None,
            data: serde_json::json!({ "tenantId": tenant_id, "parserId": parser_id }),
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// Validates a build-start event and turns it into a request
    pub fn to_build_request(
        &self,
        received_at: DateTime<Utc>,
    ) -> Result<BuildRequest, ValidationError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        if id.len() > MAX_EVENT_ID_LENGTH {
            return Err(ValidationError::IdTooLong {
                max: MAX_EVENT_ID_LENGTH,
            });
        }

        let payload: BuildStartPayload = serde_json::from_value(self.data.clone())
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        let key = BuildKey::parse(&payload.tenant_id, &payload.parser_id)?;

        Ok(BuildRequest::new(id, key, received_at))
    }
}
