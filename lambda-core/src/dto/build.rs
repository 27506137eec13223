//! Build view DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::build::{BuildJob, StageAttempts};
use crate::domain::error::ErrorKind;

/// Flat view of a recorded build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildView {
    pub request_id: String,
    pub job_id: Uuid,
    pub tenant_id: String,
    pub parser_id: String,
    pub status: String,
    pub attempts: StageAttempts,
    pub received_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub image: Option<String>,
    pub image_digest: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl From<&BuildJob> for BuildView {
    fn from(job: &BuildJob) -> Self {
        let (error_kind, error_message) = match &job.status {
            crate::domain::BuildStatus::Failed {
                error_kind,
                message,
            } => (Some(*error_kind), Some(message.clone())),
            _ => (None, None),
        };

        Self {
            request_id: job.request.request_id.clone(),
            job_id: job.job_id,
            tenant_id: job.request.tenant_id.clone(),
            parser_id: job.request.parser_id.clone(),
            status: job.status.name().to_string(),
            attempts: job.attempts,
            received_at: job.request.received_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            image: job.status.image().map(|image| image.tagged()),
            image_digest: job.image_digest().map(str::to_string),
            error_kind,
            error_message,
        }
    }
}

/// How an inbound event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    /// New build handed to the pipeline
    Accepted,
    /// New build waiting behind an active build of the same key
    Queued,
    /// Event id already seen
    Duplicate,
}

/// Response to an accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptView {
    pub receipt: ReceiptKind,
    pub build: BuildView,
}
