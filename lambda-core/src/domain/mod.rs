//! Core domain types
//!
//! These types describe one build from the moment its event is received until
//! it reaches a terminal state. They carry no I/O; persistence lives in the
//! builder's repositories and execution in its services.

pub mod artifact;
pub mod build;
pub mod error;

pub use artifact::{Artifact, ContentHash, ImageRef, sha256_hex};
pub use build::{BuildJob, BuildKey, BuildRequest, BuildStatus, Stage, StageAttempts};
pub use error::{ErrorKind, TransitionError, ValidationError};
