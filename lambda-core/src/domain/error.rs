//! Error taxonomy for builds

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured reason a build ended in `Failed`
///
/// Sent to the downstream controller so it can tell "fix your source"
/// apart from "try again later" and "infrastructure problem".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed inbound event
    ValidationError,
    /// Source object missing, empty, oversized or unreadable
    DownloadError,
    /// Builder exited non-zero
    BuildError,
    /// Job or node level disruption unrelated to the source
    InfraError,
    /// Build exceeded its deadline
    TimeoutError,
    /// Artifact upload or integrity failure
    PublishError,
    /// Build was cancelled on request
    CancelledError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::ValidationError,
        ErrorKind::DownloadError,
        ErrorKind::BuildError,
        ErrorKind::InfraError,
        ErrorKind::TimeoutError,
        ErrorKind::PublishError,
        ErrorKind::CancelledError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::DownloadError => "DownloadError",
            ErrorKind::BuildError => "BuildError",
            ErrorKind::InfraError => "InfraError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::PublishError => "PublishError",
            ErrorKind::CancelledError => "CancelledError",
        }
    }

    /// Parses the name produced by [`ErrorKind::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Whether resubmitting the same source could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::InfraError | ErrorKind::TimeoutError | ErrorKind::PublishError => true,
            ErrorKind::ValidationError
            | ErrorKind::DownloadError
            | ErrorKind::BuildError
            | ErrorKind::CancelledError => false,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected inbound event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event id is missing")]
    MissingId,

    #[error("event id is longer than {max} characters")]
    IdTooLong { max: usize },

    #[error("malformed build payload: {0}")]
    MalformedPayload(String),

    #[error("invalid {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },
}

/// Rejected lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("build is already {0} and cannot change state")]
    AlreadyTerminal(&'static str),

    #[error("build cannot move from {from} to {to}")]
    OutOfOrder {
        from: &'static str,
        to: &'static str,
    },
}
