//! Repository Module
//!
//! Durable record of every build. The status of a build is written here
//! before it is announced anywhere else.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use lambda_core::domain::{BuildJob, BuildKey};

use crate::retry::Retryable;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

#[derive(Debug, Error)]
pub enum StoreRepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A job for this request id already exists
    #[error("build for request {0} already exists")]
    Conflict(String),

    #[error("build {0} not found")]
    NotFound(String),

    /// The stored build already reached a terminal state
    #[error("build for request {0} is already finished")]
    Settled(String),

    /// Another build of the same key is active
    #[error("another build of {0} is active")]
    KeyBusy(String),

    #[error("stored build {job_id} is unreadable: {reason}")]
    Corrupt { job_id: String, reason: String },
}

impl Retryable for StoreRepoError {
    fn is_transient(&self) -> bool {
        match self {
            StoreRepoError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            StoreRepoError::Conflict(_)
            | StoreRepoError::NotFound(_)
            | StoreRepoError::Settled(_)
            | StoreRepoError::KeyBusy(_)
            | StoreRepoError::Corrupt { .. } => false,
        }
    }
}

/// Build record storage
///
/// Each store instance has its own owner identity. Unfinished jobs carry
/// the owner that recorded them and a lease the owner renews while it is
/// alive; jobs whose lease lapsed belong to a departed instance.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Records a new job; `Conflict` when its request id is already known
    async fn insert(&self, job: &BuildJob) -> Result<(), StoreRepoError>;

    /// Overwrites the stored state of an unfinished job
    ///
    /// `Settled` when the stored job is already terminal; `KeyBusy` when
    /// `job` would become active while another job of its key is.
    async fn update(&self, job: &BuildJob) -> Result<(), StoreRepoError>;

    async fn find_by_request(&self, request_id: &str) -> Result<Option<BuildJob>, StoreRepoError>;

    /// The job currently owned by a pipeline stage for `key`, if any
    async fn find_active_by_key(&self, key: &BuildKey) -> Result<Option<BuildJob>, StoreRepoError>;

    /// Renews the lease of this owner's unfinished jobs, returning how many
    async fn renew_leases(&self, at: DateTime<Utc>) -> Result<u64, StoreRepoError>;

    /// Unfinished jobs of other owners whose lease was last renewed before
    /// `stale_before`, oldest first
    async fn list_orphaned(&self, stale_before: DateTime<Utc>) -> Result<Vec<BuildJob>, StoreRepoError>;

    /// Deletes terminal jobs finished before `cutoff`, returning how many
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreRepoError>;
}
