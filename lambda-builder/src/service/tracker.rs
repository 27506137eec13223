//! Build tracking
//!
//! Every job state change goes to the [`JobStore`] first and is then pushed
//! to a watch channel per in-flight build, which is what a [`BuildHandle`]
//! observes. The watch map doubles as the in-flight deduplication table.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use lambda_core::domain::{BuildJob, BuildRequest};

use crate::repository::{JobStore, StoreRepoError};

/// Observer of one build's state
#[derive(Debug, Clone)]
pub struct BuildHandle {
    rx: watch::Receiver<BuildJob>,
}

impl BuildHandle {
    /// A handle for a build that will not change anymore
    pub fn settled(job: BuildJob) -> Self {
        let (_tx, rx) = watch::channel(job);
        Self { rx }
    }

    pub fn current(&self) -> BuildJob {
        self.rx.borrow().clone()
    }

    /// Waits until the build is Completed or Failed
    ///
    /// Returns the last known state if the build is abandoned first.
    pub async fn finished(mut self) -> BuildJob {
        if let Ok(job) = self.rx.wait_for(|job| job.status.is_terminal()).await {
            return job.clone();
        }
        self.rx.borrow().clone()
    }
}

/// Result of opening a build for a request
#[derive(Debug)]
pub enum Opened {
    /// A new job was recorded
    New(BuildJob, BuildHandle),
    /// The request id is already known
    Existing(BuildJob, BuildHandle),
}

pub struct JobTracker {
    store: Arc<dyn JobStore>,
    watchers: DashMap<String, watch::Sender<BuildJob>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            watchers: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Records a job for `request` unless its id has been seen before
    pub async fn open(&self, request: BuildRequest) -> Result<Opened, StoreRepoError> {
        let request_id = request.request_id.clone();

        if let Some((job, handle)) = self.existing(&request_id).await? {
            return Ok(Opened::Existing(job, handle));
        }

        let job = BuildJob::new(request);
        let handle = match self.watchers.entry(request_id.clone()) {
            Entry::Occupied(entry) => {
                let rx = entry.get().subscribe();
                let current = rx.borrow().clone();
                return Ok(Opened::Existing(current, BuildHandle { rx }));
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(job.clone());
                slot.insert(tx);
                BuildHandle { rx }
            }
        };

        match self.store.insert(&job).await {
            Ok(()) => {
                debug!("Recorded build {} for request {}", job.job_id, request_id);
                Ok(Opened::New(job, handle))
            }
            Err(StoreRepoError::Conflict(_)) => {
                // Another instance recorded it between our lookup and insert
                self.watchers.remove(&request_id);
                let stored = self
                    .store
                    .find_by_request(&request_id)
                    .await?
                    .ok_or_else(|| StoreRepoError::NotFound(request_id.clone()))?;
                Ok(Opened::Existing(stored.clone(), BuildHandle::settled(stored)))
            }
            Err(e) => {
                self.watchers.remove(&request_id);
                Err(e)
            }
        }
    }

    /// A build already known for `request_id`, in flight or recorded
    pub async fn existing(
        &self,
        request_id: &str,
    ) -> Result<Option<(BuildJob, BuildHandle)>, StoreRepoError> {
        if let Some(handle) = self.subscribe(request_id) {
            return Ok(Some((handle.current(), handle)));
        }
        Ok(self
            .store
            .find_by_request(request_id)
            .await?
            .map(|job| (job.clone(), BuildHandle::settled(job))))
    }

    /// Durably records `job`, then notifies its observers
    pub async fn record(&self, job: &BuildJob) -> Result<(), StoreRepoError> {
        self.store.update(job).await?;
        self.notify(job);
        Ok(())
    }

    /// Pushes `job` to its observers without touching the store
    ///
    /// Terminal states close the channel and end in-flight deduplication;
    /// later redeliveries are answered from the store.
    pub fn notify(&self, job: &BuildJob) {
        if let Some(tx) = self.watchers.get(job.request_id()) {
            tx.send_replace(job.clone());
        }
        if job.status.is_terminal() {
            self.watchers.remove(job.request_id());
        }
    }

    /// Current state of a build, in flight or recorded
    pub async fn lookup(&self, request_id: &str) -> Result<Option<BuildJob>, StoreRepoError> {
        if let Some(tx) = self.watchers.get(request_id) {
            return Ok(Some(tx.borrow().clone()));
        }
        self.store.find_by_request(request_id).await
    }

    pub fn subscribe(&self, request_id: &str) -> Option<BuildHandle> {
        self.watchers.get(request_id).map(|tx| BuildHandle {
            rx: tx.subscribe(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.watchers.len()
    }
}

/// Periodically deletes terminal build records older than `retention`
pub fn spawn_janitor(
    store: Arc<dyn JobStore>,
    retention: Duration,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Ok(retention) = chrono::Duration::from_std(retention) else {
                error!("Job retention {:?} is out of range, janitor stopped", retention);
                return;
            };
            let cutoff = Utc::now() - retention;

            match store.purge_finished_before(cutoff).await {
                Ok(0) => {}
                Ok(purged) => info!("Purged {} finished build(s) older than {}", purged, cutoff),
                Err(e) => error!("Failed to purge finished builds: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobStore;
    use lambda_core::domain::{BuildKey, BuildStatus, ErrorKind};

    fn request(id: &str) -> BuildRequest {
        BuildRequest::new(id, BuildKey::parse("acme", "csv-v1").unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn test_open_deduplicates_in_flight_requests() {
        let tracker = JobTracker::new(Arc::new(InMemoryJobStore::new()));

        let Opened::New(job, _) = tracker.open(request("evt-1")).await.unwrap() else {
            panic!("first open must record a job");
        };
        let Opened::Existing(seen, _) = tracker.open(request("evt-1")).await.unwrap() else {
            panic!("second open must be a duplicate");
        };

        assert_eq!(seen.job_id, job.job_id);
        assert_eq!(tracker.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_observes_original_result() {
        let tracker = JobTracker::new(Arc::new(InMemoryJobStore::new()));

        let Opened::New(mut job, _) = tracker.open(request("evt-1")).await.unwrap() else {
            panic!("first open must record a job");
        };
        let Opened::Existing(_, handle) = tracker.open(request("evt-1")).await.unwrap() else {
            panic!("second open must be a duplicate");
        };

        let waiter = tokio::spawn(handle.finished());

        job.advance(BuildStatus::Assembling).unwrap();
        tracker.record(&job).await.unwrap();
        job.fail(ErrorKind::BuildError, "exit 1").unwrap();
        tracker.record(&job).await.unwrap();

        let finished = waiter.await.unwrap();
        assert_eq!(finished.status.error_kind(), Some(ErrorKind::BuildError));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_terminal_request_is_answered_from_store() {
        let tracker = JobTracker::new(Arc::new(InMemoryJobStore::new()));

        let Opened::New(mut job, _) = tracker.open(request("evt-1")).await.unwrap() else {
            panic!("first open must record a job");
        };
        job.fail(ErrorKind::DownloadError, "missing").unwrap();
        tracker.record(&job).await.unwrap();

        let Opened::Existing(seen, handle) = tracker.open(request("evt-1")).await.unwrap() else {
            panic!("redelivery must be a duplicate");
        };
        assert_eq!(seen.status, job.status);
        assert_eq!(handle.finished().await.status, job.status);
        assert_eq!(tracker.lookup("evt-1").await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_concurrent_opens_record_one_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let tracker = Arc::new(JobTracker::new(store.clone()));

        let opens: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.open(request("evt-1")).await.unwrap() })
            })
            .collect();

        let mut new = 0;
        for open in opens {
            if let Opened::New(..) = open.await.unwrap() {
                new += 1;
            }
        }

        assert_eq!(new, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_purges_old_builds() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut job = BuildJob::new(request("evt-1"));
        job.fail(ErrorKind::BuildError, "exit 1").unwrap();
        job.finished_at = Some(Utc::now() - chrono::Duration::hours(48));
        store.insert(&job).await.unwrap();

        let janitor = spawn_janitor(
            store.clone(),
            Duration::from_secs(86_400),
            Duration::from_secs(60),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        janitor.abort();

        assert!(store.is_empty());
    }
}
