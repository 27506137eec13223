//! Isolated build job execution
//!
//! A build runs as one detached, rootless job. The orchestrator only sees the
//! [`JobRuntime`] trait; podman is the production implementation.

mod podman;
mod template;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use podman::PodmanRuntime;
pub use template::{JobTemplate, RenderedJob, RenderedResources, TemplateError, TemplateParams};

/// Host directory exposed inside the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResources {
    pub cpus: String,
    pub memory: String,
    pub memory_reservation: String,
}

/// Everything needed to start one build job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Unique job name, also used to address the job afterwards
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: JobResources,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Host path where the builder writes the pushed image digest
    pub digest_file: PathBuf,
}

/// A submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub name: String,
    pub id: String,
    pub digest_file: PathBuf,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExit {
    /// Exit code 0; digest as written by the builder, if any
    Succeeded { digest: Option<String> },
    /// Non-zero exit of the builder process
    Failed { exit_code: i32, log_tail: String },
    /// Terminated by a signal
    Killed { exit_code: i32, oom: bool },
    /// The job disappeared before reporting an exit status
    Vanished,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("job runtime unavailable: {0}")]
    Unavailable(String),

    #[error("job {name} was refused: {message}")]
    Refused { name: String, message: String },

    #[error("job runtime command failed: {0}")]
    Command(String),
}

/// Submits and supervises build jobs
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Starts a job without waiting for it
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, RuntimeError>;

    /// Blocks until the job exits
    async fn wait(&self, handle: &JobHandle) -> Result<JobExit, RuntimeError>;

    /// Force-removes the job; removing a missing job succeeds
    async fn delete(&self, handle: &JobHandle) -> Result<(), RuntimeError>;

    /// Last `tail` lines of the job output
    async fn logs(&self, handle: &JobHandle, tail: usize) -> Result<String, RuntimeError>;
}
