use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use lambda_core::domain::{BuildJob, BuildKey};

use super::{JobStore, StoreRepoError};

#[derive(Debug, Clone)]
struct Row {
    job: BuildJob,
    owner: String,
    renewed_at: DateTime<Utc>,
}

/// Process-local job store, used when no database is configured
///
/// [`InMemoryJobStore::peer`] gives another owner's view of the same
/// records, the way two instances share one database.
pub struct InMemoryJobStore {
    rows: Arc<DashMap<String, Row>>,
    /// Serializes updates so the per-key check and the write are one step
    writes: Arc<Mutex<()>>,
    owner: String,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            writes: Arc::new(Mutex::new(())),
            owner: Uuid::new_v4().to_string(),
        }
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same records seen by a different owner
    pub fn peer(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            writes: Arc::clone(&self.writes),
            owner: Uuid::new_v4().to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn other_active(&self, job: &BuildJob) -> bool {
        let key = job.key();
        self.rows.iter().any(|row| {
            let stored = &row.value().job;
            stored.job_id != job.job_id && stored.status.is_active() && stored.key() == key
        })
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &BuildJob) -> Result<(), StoreRepoError> {
        match self.rows.entry(job.request_id().to_string()) {
            Entry::Occupied(_) => Err(StoreRepoError::Conflict(job.request_id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Row {
                    job: job.clone(),
                    owner: self.owner.clone(),
                    renewed_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    async fn update(&self, job: &BuildJob) -> Result<(), StoreRepoError> {
        let _writing = self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.rows.get(job.request_id()) {
            Some(row) if row.job.job_id == job.job_id => {
                if row.job.status.is_terminal() {
                    return Err(StoreRepoError::Settled(job.request_id().to_string()));
                }
            }
            _ => return Err(StoreRepoError::NotFound(job.job_id.to_string())),
        }

        if job.status.is_active() && self.other_active(job) {
            return Err(StoreRepoError::KeyBusy(job.key().to_string()));
        }

        if let Some(mut row) = self.rows.get_mut(job.request_id()) {
            row.job = job.clone();
            row.renewed_at = Utc::now();
        }
        Ok(())
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<BuildJob>, StoreRepoError> {
        Ok(self.rows.get(request_id).map(|row| row.job.clone()))
    }

    async fn find_active_by_key(&self, key: &BuildKey) -> Result<Option<BuildJob>, StoreRepoError> {
        Ok(self
            .rows
            .iter()
            .map(|row| row.value().job.clone())
            .filter(|job| job.status.is_active() && job.key() == *key)
            .min_by_key(|job| job.request.received_at))
    }

    async fn renew_leases(&self, at: DateTime<Utc>) -> Result<u64, StoreRepoError> {
        let mut renewed = 0;
        for mut row in self.rows.iter_mut() {
            if row.owner == self.owner && !row.job.status.is_terminal() {
                row.renewed_at = at;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn list_orphaned(&self, stale_before: DateTime<Utc>) -> Result<Vec<BuildJob>, StoreRepoError> {
        let mut jobs: Vec<BuildJob> = self
            .rows
            .iter()
            .filter(|row| {
                !row.job.status.is_terminal()
                    && row.owner != self.owner
                    && row.renewed_at < stale_before
            })
            .map(|row| row.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.request.received_at);
        Ok(jobs)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreRepoError> {
        let before = self.rows.len();
        self.rows
            .retain(|_, row| !matches!(row.job.finished_at, Some(at) if at < cutoff));
        Ok((before - self.rows.len()) as u64)
    }
}
