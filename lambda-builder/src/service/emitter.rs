//! Status announcements
//!
//! Terminal build states are announced once, after they have been recorded.
//! Delivery is retried on transient failures and given up on permanent ones;
//! either way the build's recorded state is unaffected.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use lambda_core::domain::BuildJob;
use lambda_core::dto::status::StatusEvent;

use crate::deadline::Deadline;
use crate::retry::{Backoff, Retryable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("status delivery failed: {0}")]
    Transient(String),

    #[error("status delivery rejected: {0}")]
    Rejected(String),
}

impl Retryable for SinkError {
    fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Destination of outbound status events
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), SinkError>;
}

/// Posts status events as JSON to a webhook
pub struct HttpStatusSink {
    client: Client,
    url: String,
}

impl HttpStatusSink {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Err(SinkError::Transient(format!("{} - {}", status, body)))
        } else {
            Err(SinkError::Rejected(format!("{} - {}", status, body)))
        }
    }
}

/// Writes status events to the log, for deployments without a webhook
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), SinkError> {
        let payload =
            serde_json::to_string(event).map_err(|e| SinkError::Rejected(e.to_string()))?;
        info!("Build status event: {}", payload);
        Ok(())
    }
}

pub struct StatusEmitter {
    sink: Arc<dyn StatusSink>,
    backoff: Backoff,
    io_timeout: Duration,
    source: String,
}

impl StatusEmitter {
    pub fn new(sink: Arc<dyn StatusSink>, backoff: Backoff, io_timeout: Duration, source: String) -> Self {
        Self {
            sink,
            backoff,
            io_timeout,
            source,
        }
    }

    /// Announces a terminal job; returns whether the event was delivered
    pub async fn announce(&self, job: &BuildJob) -> bool {
        let Some(event) = StatusEvent::for_job(job, &self.source) else {
            warn!(
                "Not announcing build {} in non-terminal state {}",
                job.request_id(),
                job.status
            );
            return false;
        };

        // Worst case: every attempt times out and every delay is slept
        let budget = self.io_timeout * self.backoff.max_attempts
            + self.backoff.max_delay * self.backoff.max_attempts;
        let deadline = Deadline::after(budget);
        let event = &event;
        let label = format!("status event for {}", job.request_id());

        let outcome = self
            .backoff
            .run(&deadline, &label, || async move {
                deadline
                    .bound(self.io_timeout, self.sink.deliver(event))
                    .await
                    .unwrap_or_else(|e| Err(SinkError::Transient(e.to_string())))
            })
            .await;

        match outcome.result {
            Ok(()) => {
                info!(
                    "Announced {} for request {} ({})",
                    job.status,
                    job.request_id(),
                    event.id
                );
                true
            }
            Err(e) => {
                error!(
                    "Giving up announcing {} for request {} after {} attempt(s): {}",
                    job.status,
                    job.request_id(),
                    outcome.attempts,
                    e
                );
                false
            }
        }
    }
}
