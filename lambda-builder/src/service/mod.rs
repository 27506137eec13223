//! Service Module
//!
//! The build pipeline: ingress, per-key dispatch, context assembly, job
//! orchestration, publishing and status reporting.

pub mod assembler;
pub mod cancel;
pub mod dispatch;
pub mod emitter;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;
pub mod receiver;
pub mod tracker;

use lambda_core::domain::ErrorKind;
use std::fmt;

pub use assembler::{BuildContext, BuildContextAssembler};
pub use cancel::Cancellations;
pub use dispatch::{Dispatcher, KeyedQueue};
pub use emitter::{HttpStatusSink, LogStatusSink, SinkError, StatusEmitter, StatusSink};
pub use orchestrator::{BuiltImage, JobOrchestrator};
pub use pipeline::BuildPipeline;
pub use publisher::ArtifactPublisher;
pub use receiver::{CancelOutcome, EventReceiver, Receipt, ReceiveError};
pub use tracker::{BuildHandle, JobTracker};

/// Terminal failure of a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
