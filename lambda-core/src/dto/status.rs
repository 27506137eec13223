//! Outbound status event DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::build::{BuildJob, BuildStatus};
use crate::domain::error::ErrorKind;

/// Type identifier of the event announcing a terminal build state
pub const BUILD_FINISHED_EVENT_TYPE: &str = "lambda.build.finished";

/// CloudEvent-style announcement of a finished build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub specversion: String,
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub time: DateTime<Utc>,
    pub data: BuildOutcome,
}

/// Terminal state of one build, correlated to its inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub correlation_id: String,
    pub job_id: Uuid,
    pub tenant_id: String,
    pub parser_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    /// Builds the announcement for a terminal job, `None` otherwise
    pub fn for_job(job: &BuildJob, source: &str) -> Option<Self> {
        let (image, image_digest, error_kind, message) = match &job.status {
            BuildStatus::Completed { image } => {
                (Some(image.tagged()), image.digest.clone(), None, None)
            }
            BuildStatus::Failed {
                error_kind,
                message,
            } => (None, None, Some(*error_kind), Some(message.clone())),
            BuildStatus::Received
            | BuildStatus::Assembling
            | BuildStatus::Building
            | BuildStatus::Publishing => return None,
        };

        Some(Self {
            specversion: "1.0".to_string(),
            id: Uuid::new_v4(),
            event_type: BUILD_FINISHED_EVENT_TYPE.to_string(),
            source: source.to_string(),
            time: job.finished_at.unwrap_or_else(Utc::now),
            data: BuildOutcome {
                correlation_id: job.request.request_id.clone(),
                job_id: job.job_id,
                tenant_id: job.request.tenant_id.clone(),
                parser_id: job.request.parser_id.clone(),
                status: job.status.name().to_string(),
                image,
                image_digest,
                error_kind,
                message,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::artifact::ImageRef;
    use crate::domain::build::{BuildKey, BuildRequest};

    fn job() -> BuildJob {
        let key = BuildKey::parse("acme", "csv-v1").unwrap();
        BuildJob::new(BuildRequest::new("evt-7", key, Utc::now()))
    }

    #[test]
    fn test_no_event_for_running_build() {
        let mut job = job();
        assert!(StatusEvent::for_job(&job, "test").is_none());
        job.advance(BuildStatus::Assembling).unwrap();
        assert!(StatusEvent::for_job(&job, "test").is_none());
    }

    #[test]
    fn test_completed_event_carries_image() {
        let mut job = job();
        for next in [
            BuildStatus::Assembling,
            BuildStatus::Building,
            BuildStatus::Publishing,
        ] {
            job.advance(next).unwrap();
        }
        job.complete(ImageRef::new("reg/acme/csv-v1", "abc").with_digest("sha256:9"))
            .unwrap();

        let event = StatusEvent::for_job(&job, "lambda-builder").unwrap();
        assert_eq!(event.event_type, BUILD_FINISHED_EVENT_TYPE);
        assert_eq!(event.data.correlation_id, "evt-7");
        assert_eq!(event.data.status, "Completed");
        assert_eq!(event.data.image.as_deref(), Some("reg/acme/csv-v1:abc"));
        assert_eq!(event.data.image_digest.as_deref(), Some("sha256:9"));
        assert_eq!(event.data.error_kind, None);

        let json = serde_json::to_value(&event).unwrap();
        assert!(json["data"].get("errorKind").is_none());
    }

    #[test]
    fn test_failed_event_carries_error_kind() {
        let mut job = job();
        job.fail(ErrorKind::DownloadError, "source missing").unwrap();

        let event = StatusEvent::for_job(&job, "lambda-builder").unwrap();
        assert_eq!(event.data.status, "Failed");
        assert_eq!(event.data.error_kind, Some(ErrorKind::DownloadError));
        assert_eq!(event.data.image, None);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["errorKind"], "DownloadError");
        assert_eq!(json["type"], BUILD_FINISHED_EVENT_TYPE);
    }
}
