//! Bounded, per-key ordered dispatch
//!
//! Accepted builds flow through a bounded channel to a fixed pool of workers.
//! A [`KeyedQueue`] keeps at most one build per [`BuildKey`] in the channel
//! or running; later builds of the same key wait in arrival order and are
//! picked up by the worker that finishes the current one.
//!
//! Capacity is a semaphore: a [`Slot`] is taken before anything is recorded
//! and held until a worker starts the build, so waiting builds (in the
//! channel or behind their key) never exceed the configured capacity.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use lambda_core::domain::{BuildJob, BuildKey};

/// Runs one build to a terminal state
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, job: BuildJob);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("build queue is full")]
    Full,

    #[error("dispatcher is shut down")]
    Closed,
}

/// Reserved room in the dispatch queue
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct WorkItem {
    pub job: BuildJob,
    slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed to the workers
    Started,
    /// Waiting behind an active build of the same key
    Queued,
}

/// Active keys and the builds waiting behind them
#[derive(Debug, Default)]
pub struct KeyedQueue {
    active: DashMap<BuildKey, VecDeque<WorkItem>>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the item's key active and returns the item, or parks it behind
    /// the key's active build and returns None
    pub fn admit(&self, item: WorkItem) -> Option<WorkItem> {
        match self.active.entry(item.job.key()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push_back(item);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Some(item)
            }
        }
    }

    /// Next waiting build of `key`; releases the key when none is left
    pub fn next(&self, key: &BuildKey) -> Option<WorkItem> {
        match self.active.entry(key.clone()) {
            Entry::Occupied(mut waiting) => {
                let item = waiting.get_mut().pop_front();
                if item.is_none() {
                    waiting.remove();
                }
                item
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Drops the key and everything waiting behind it
    fn abandon(&self, key: &BuildKey) {
        self.active.remove(key);
    }

    pub fn is_active(&self, key: &BuildKey) -> bool {
        self.active.contains_key(key)
    }

    /// Builds parked behind an active key
    pub fn waiting(&self) -> usize {
        self.active.iter().map(|entry| entry.value().len()).sum()
    }
}

pub struct Dispatcher {
    tx: mpsc::Sender<WorkItem>,
    capacity: Arc<Semaphore>,
    queue: Arc<KeyedQueue>,
}

impl Dispatcher {
    /// Creates a dispatcher holding at most `capacity` waiting builds
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Self {
            tx,
            capacity: Arc::new(Semaphore::new(capacity)),
            queue: Arc::new(KeyedQueue::new()),
        };
        (dispatcher, rx)
    }

    pub fn queue(&self) -> Arc<KeyedQueue> {
        Arc::clone(&self.queue)
    }

    /// Free room in the queue
    pub fn available(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Reserves room for one build without waiting
    pub fn reserve(&self) -> Result<Slot, DispatchError> {
        if self.tx.is_closed() {
            return Err(DispatchError::Closed);
        }
        self.capacity
            .clone()
            .try_acquire_owned()
            .map(|permit| Slot { _permit: permit })
            .map_err(|_| DispatchError::Full)
    }

    /// Hands `job` to the workers, or parks it behind its key
    pub fn dispatch(&self, slot: Slot, job: BuildJob) -> Result<Admission, DispatchError> {
        let key = job.key();
        let Some(item) = self.queue.admit(WorkItem { job, slot }) else {
            debug!("Build for {} queued behind the active one", key);
            return Ok(Admission::Queued);
        };

        match self.tx.try_send(item) {
            Ok(()) => Ok(Admission::Started),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.queue.abandon(&key);
                Err(DispatchError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queue.abandon(&key);
                Err(DispatchError::Closed)
            }
        }
    }
}

/// Starts `count` workers draining `rx`
///
/// Workers exit once every [`Dispatcher`] is dropped and the channel is
/// empty.
pub fn spawn_workers(
    count: usize,
    rx: mpsc::Receiver<WorkItem>,
    queue: Arc<KeyedQueue>,
    runner: Arc<dyn BuildRunner>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    info!("Starting {} build worker(s)", count);

    (0..count)
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                loop {
                    let item = rx.lock().await.recv().await;
                    let Some(item) = item else {
                        debug!("Worker {} stopping", worker);
                        return;
                    };

                    let key = item.job.key();
                    let mut next = Some(item);
                    while let Some(WorkItem { job, slot }) = next {
                        drop(slot);
                        runner.run(job).await;
                        next = queue.next(&key);
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::job_for;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records run order and the peak number of concurrent runs per key
    #[derive(Default)]
    struct RecordingRunner {
        order: StdMutex<Vec<String>>,
        running: DashMap<BuildKey, usize>,
        peak_per_key: AtomicUsize,
    }

    #[async_trait]
    impl BuildRunner for RecordingRunner {
        async fn run(&self, job: BuildJob) {
            let key = job.key();
            {
                let mut running = self.running.entry(key.clone()).or_insert(0);
                *running += 1;
                self.peak_per_key.fetch_max(*running, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(mut running) = self.running.get_mut(&key) {
                *running -= 1;
            }
            self.order.lock().unwrap().push(job.request_id().to_string());
        }
    }

    #[test]
    fn test_keyed_queue_orders_within_key() {
        let (dispatcher, _rx) = Dispatcher::new(8);
        let queue = dispatcher.queue();
        let slot = || dispatcher.reserve().unwrap();
        let key = BuildKey::parse("acme", "csv-v1").unwrap();

        let first = queue.admit(WorkItem {
            job: job_for("evt-1", "acme", "csv-v1"),
            slot: slot(),
        });
        assert!(first.is_some());
        assert!(queue.is_active(&key));

        for id in ["evt-2", "evt-3"] {
            let parked = queue.admit(WorkItem {
                job: job_for(id, "acme", "csv-v1"),
                slot: slot(),
            });
            assert!(parked.is_none());
        }
        assert_eq!(queue.waiting(), 2);

        assert_eq!(queue.next(&key).unwrap().job.request_id(), "evt-2");
        assert_eq!(queue.next(&key).unwrap().job.request_id(), "evt-3");
        assert!(queue.next(&key).is_none());
        assert!(!queue.is_active(&key));
    }

    #[test]
    fn test_reserve_sheds_load_when_full() {
        let (dispatcher, _rx) = Dispatcher::new(2);

        let a = dispatcher.reserve().unwrap();
        let _b = dispatcher.reserve().unwrap();
        assert_eq!(dispatcher.reserve().unwrap_err(), DispatchError::Full);

        drop(a);
        assert!(dispatcher.reserve().is_ok());
    }

    #[test]
    fn test_dispatch_reports_queued_behind_active_key() {
        let (dispatcher, _rx) = Dispatcher::new(4);

        let first = dispatcher
            .dispatch(dispatcher.reserve().unwrap(), job_for("evt-1", "acme", "csv-v1"))
            .unwrap();
        let second = dispatcher
            .dispatch(dispatcher.reserve().unwrap(), job_for("evt-2", "acme", "csv-v1"))
            .unwrap();
        let other = dispatcher
            .dispatch(dispatcher.reserve().unwrap(), job_for("evt-3", "acme", "json-v2"))
            .unwrap();

        assert_eq!(first, Admission::Started);
        assert_eq!(second, Admission::Queued);
        assert_eq!(other, Admission::Started);
        assert_eq!(dispatcher.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_keep_one_build_per_key() {
        let (dispatcher, rx) = Dispatcher::new(16);
        let runner = Arc::new(RecordingRunner::default());
        let workers = spawn_workers(4, rx, dispatcher.queue(), runner.clone());

        for (id, parser) in [
            ("evt-1", "csv-v1"),
            ("evt-2", "csv-v1"),
            ("evt-3", "json-v2"),
            ("evt-4", "csv-v1"),
        ] {
            let slot = dispatcher.reserve().unwrap();
            dispatcher.dispatch(slot, job_for(id, "acme", parser)).unwrap();
        }

        drop(dispatcher);
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(runner.peak_per_key.load(Ordering::SeqCst), 1);
        let order = runner.order.lock().unwrap().clone();
        let csv: Vec<_> = order.iter().filter(|id| *id != "evt-3").cloned().collect();
        assert_eq!(csv, vec!["evt-1", "evt-2", "evt-4"]);
        assert_eq!(order.len(), 4);
    }
}
