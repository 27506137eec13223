//! Event ingress
//!
//! Validates inbound events, answers redeliveries from what is already
//! known, and hands new builds to the dispatcher without waiting for them.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use lambda_core::domain::{BuildJob, ErrorKind, ValidationError};
use lambda_core::dto::event::{EventKind, InboundEvent};

use super::cancel::Cancellations;
use super::dispatch::{Admission, DispatchError, Dispatcher};
use super::orchestrator::JobOrchestrator;
use super::tracker::{BuildHandle, JobTracker, Opened};
use crate::repository::StoreRepoError;

/// How an event was handled
#[derive(Debug)]
pub enum Receipt {
    /// New build handed to the workers
    Accepted(BuildJob, BuildHandle),
    /// New build waiting behind an active build of the same key
    Queued(BuildJob, BuildHandle),
    /// Event id seen before; the handle follows the first build
    Duplicate(BuildJob, BuildHandle),
    /// Event type this service does not handle
    Ignored { event_type: String },
}

impl Receipt {
    pub fn handle(&self) -> Option<&BuildHandle> {
        match self {
            Receipt::Accepted(_, handle)
            | Receipt::Queued(_, handle)
            | Receipt::Duplicate(_, handle) => Some(handle),
            Receipt::Ignored { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Build capacity is exhausted; the sender should retry later
    #[error("build queue is full")]
    Overloaded,

    #[error("builder unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreRepoError> for ReceiveError {
    fn from(e: StoreRepoError) -> Self {
        ReceiveError::Unavailable(e.to_string())
    }
}

#[derive(Debug)]
pub enum CancelOutcome {
    NotFound,
    AlreadyFinished(BuildJob),
    /// Cancellation recorded; the build fails with `CancelledError`
    Requested(BuildJob),
}

pub struct EventReceiver {
    tracker: Arc<JobTracker>,
    dispatcher: Dispatcher,
    cancellations: Arc<Cancellations>,
    orchestrator: Arc<JobOrchestrator>,
}

impl EventReceiver {
    pub fn new(
        tracker: Arc<JobTracker>,
        dispatcher: Dispatcher,
        cancellations: Arc<Cancellations>,
        orchestrator: Arc<JobOrchestrator>,
    ) -> Self {
        Self {
            tracker,
            dispatcher,
            cancellations,
            orchestrator,
        }
    }

    /// Handles one inbound event
    ///
    /// Returns as soon as the build is recorded and dispatched; use the
    /// receipt's handle to wait for the outcome.
    pub async fn receive(&self, event: InboundEvent) -> Result<Receipt, ReceiveError> {
        match event.kind() {
            EventKind::BuildStart => {}
            EventKind::Unrecognized(event_type) => {
                debug!("Ignoring event {} of type {}", event.id, event_type);
                return Ok(Receipt::Ignored { event_type });
            }
        }

        let request = event.to_build_request(Utc::now()).inspect_err(|e| {
            warn!("Rejecting event {}: {}", event.id, e);
        })?;

        if let Some((job, handle)) = self.tracker.existing(&request.request_id).await? {
            info!(
                "Event {} already seen (build {} is {})",
                request.request_id, job.job_id, job.status
            );
            return Ok(Receipt::Duplicate(job, handle));
        }

        let slot = self.dispatcher.reserve().map_err(|e| match e {
            DispatchError::Full => {
                warn!("Shedding event {}: build queue is full", request.request_id);
                ReceiveError::Overloaded
            }
            DispatchError::Closed => ReceiveError::Unavailable(e.to_string()),
        })?;

        let (job, handle) = match self.tracker.open(request).await? {
            Opened::Existing(job, handle) => return Ok(Receipt::Duplicate(job, handle)),
            Opened::New(job, handle) => (job, handle),
        };

        match self.dispatcher.dispatch(slot, job.clone()) {
            Ok(Admission::Started) => {
                info!("Accepted build {} for request {} ({})", job.job_id, job.request_id(), job.key());
                Ok(Receipt::Accepted(job, handle))
            }
            Ok(Admission::Queued) => {
                info!(
                    "Queued build {} for request {} behind the active build of {}",
                    job.job_id,
                    job.request_id(),
                    job.key()
                );
                Ok(Receipt::Queued(job, handle))
            }
            Err(e) => {
                self.abandon(job, &e).await;
                Err(match e {
                    DispatchError::Full => ReceiveError::Overloaded,
                    DispatchError::Closed => ReceiveError::Unavailable(e.to_string()),
                })
            }
        }
    }

    /// Fails a recorded build that could not be dispatched
    async fn abandon(&self, mut job: BuildJob, reason: &DispatchError) {
        if job
            .fail(ErrorKind::InfraError, format!("not dispatched: {}", reason))
            .is_ok()
        {
            if let Err(e) = self.tracker.record(&job).await {
                error!("Failed to record undispatched build {}: {}", job.request_id(), e);
                self.tracker.notify(&job);
            }
        }
    }

    /// Recorded state of a build
    pub async fn status(&self, request_id: &str) -> Result<Option<BuildJob>, ReceiveError> {
        Ok(self.tracker.lookup(request_id).await?)
    }

    /// Asks a build to stop
    ///
    /// A queued build fails with `CancelledError` when a worker picks it up;
    /// a running build has its job deleted.
    pub async fn cancel(&self, request_id: &str) -> Result<CancelOutcome, ReceiveError> {
        let Some(job) = self.tracker.lookup(request_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job));
        }

        if self.cancellations.request(request_id) {
            info!("Cancellation requested for {} in {}", request_id, job.status);
        }
        // The build may have settled since the lookup, leaving no one to clear the mark
        match self.tracker.lookup(request_id).await? {
            Some(current) if current.status.is_terminal() => {
                self.cancellations.clear(request_id);
                return Ok(CancelOutcome::AlreadyFinished(current));
            }
            _ => {}
        }
        self.orchestrator.abort(request_id).await;
        Ok(CancelOutcome::Requested(job))
    }

    /// Free room in the build queue
    pub fn available(&self) -> usize {
        self.dispatcher.available()
    }
}
