//! In-process fakes for every external seam, and a fully wired builder
//! running on them.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use lambda_core::domain::{BuildJob, BuildKey, BuildRequest, ImageRef, sha256_hex};
use lambda_core::dto::status::StatusEvent;

use crate::config::Config;
use crate::deadline::Deadline;
use crate::registry::{RegistryClient, RegistryError};
use crate::repository::InMemoryJobStore;
use crate::retry::Backoff;
use crate::runtime::{JobExit, JobHandle, JobRuntime, JobSpec, JobTemplate, RuntimeError};
use crate::service::dispatch::{WorkItem, spawn_workers};
use crate::service::{
    ArtifactPublisher, BuildContext, BuildContextAssembler, BuildPipeline, Cancellations,
    Dispatcher, EventReceiver, JobOrchestrator, JobTracker, SinkError, StatusEmitter, StatusSink,
};
use crate::storage::{ObjectStore, ObjectStoreClient, StoreError};

pub const SAMPLE_SOURCE: &[u8] = b"exports.parse = (s) => s;";

/// Consumes one unit of a countdown, false once it is exhausted
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn job_for(request_id: &str, tenant: &str, parser: &str) -> BuildJob {
    let key = BuildKey::parse(tenant, parser).unwrap();
    BuildJob::new(BuildRequest::new(request_id, key, Utc::now()))
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.registry = "registry.local/lambdas".to_string();
    config.max_concurrent_builds = 2;
    config.worker_count = 4;
    config.queue_capacity = 8;
    config.io_timeout = Duration::from_secs(5);
    config.max_source_bytes = 1024 * 1024;
    config
}

/// Context for `job` assembled from [`SAMPLE_SOURCE`] under `base`
pub async fn assembled_context(job: &BuildJob, base: &Path) -> BuildContext {
    let store = Arc::new(MemoryObjectStore::new());
    store.insert(&job.key().source_key(), SAMPLE_SOURCE);
    let objects = ObjectStoreClient::new(store, Backoff::default(), Duration::from_secs(5));
    let assembler = BuildContextAssembler::new(
        objects,
        base.to_path_buf(),
        "public.ecr.aws/lambda/nodejs:20".to_string(),
        1024 * 1024,
    );

    let deadline = Deadline::after(Duration::from_secs(60));
    assembler.assemble(job, &deadline).await.result.unwrap()
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
    failures: AtomicU32,
    corruptions: AtomicU32,
    stalled: AtomicBool,
    gets: AtomicUsize,
    puts: DashMap<String, usize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.objects.insert(key.to_string(), body.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|body| body.value().clone())
    }

    /// The next `n` operations fail with a transient error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` writes store different bytes than they were given
    pub fn corrupt_next_puts(&self, n: u32) {
        self.corruptions.store(n, Ordering::SeqCst);
    }

    /// While set, reads never complete
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self, key: &str) -> usize {
        self.puts.get(key).map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take(&self.failures) {
            return Err(StoreError::unavailable(key, "injected failure"));
        }
        self.object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, mut body: Vec<u8>) -> Result<(), StoreError> {
        if take(&self.failures) {
            return Err(StoreError::unavailable(key, "injected failure"));
        }
        *self.puts.entry(key.to_string()).or_insert(0) += 1;
        if take(&self.corruptions) {
            body.push(0);
        }
        self.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if take(&self.failures) {
            return Err(StoreError::unavailable(key, "injected failure"));
        }
        self.objects.remove(key);
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct FakeRegistry {
    tags: DashMap<String, String>,
    failures: AtomicU32,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points the image's tag at `digest`
    pub fn publish(&self, image: &ImageRef, digest: &str) {
        self.tags.insert(image.tagged(), digest.to_string());
    }

    pub fn digest_of(&self, image: &ImageRef) -> Option<String> {
        self.tags.get(&image.tagged()).map(|digest| digest.value().clone())
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn resolve(&self, image: &ImageRef) -> Result<Option<String>, RegistryError> {
        if take(&self.failures) {
            return Err(RegistryError::Unavailable("injected failure".to_string()));
        }
        Ok(self.digest_of(image))
    }
}

// ============================================================================
// Job runtime
// ============================================================================

/// What the next submitted job does
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Pushes its destination and exits 0
    Succeed,
    SucceedWithoutDigest,
    Fail { exit_code: i32, log_tail: String },
    Kill { exit_code: i32, oom: bool },
    /// Runs until deleted
    Hang,
    Vanish,
    /// Submission is refused
    Refuse,
}

struct FakeJob {
    behaviour: Behaviour,
    destination: Option<String>,
    deleted: Arc<Notify>,
}

pub struct FakeRuntime {
    registry: Arc<FakeRegistry>,
    script: Mutex<VecDeque<Behaviour>>,
    jobs: DashMap<String, FakeJob>,
    submitted: Mutex<Vec<JobSpec>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new(registry: Arc<FakeRegistry>) -> Self {
        Self {
            registry,
            script: Mutex::new(VecDeque::new()),
            jobs: DashMap::new(),
            submitted: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Queues the behaviour of a future submission; unscripted jobs succeed
    pub fn script(&self, behaviour: Behaviour) {
        self.script.lock().unwrap().push_back(behaviour);
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().unwrap().clone()
    }

    /// Names of deleted jobs, in deletion order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRuntime for FakeRuntime {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, RuntimeError> {
        let behaviour = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behaviour::Succeed);
        if let Behaviour::Refuse = behaviour {
            return Err(RuntimeError::Refused {
                name: spec.name.clone(),
                message: "injected refusal".to_string(),
            });
        }

        let destination = spec
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix("--destination="))
            .map(str::to_string);
        self.submitted.lock().unwrap().push(spec.clone());
        self.jobs.insert(
            spec.name.clone(),
            FakeJob {
                behaviour,
                destination,
                deleted: Arc::new(Notify::new()),
            },
        );

        Ok(JobHandle {
            name: spec.name.clone(),
            id: format!("fake-{}", spec.name),
            digest_file: spec.digest_file.clone(),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobExit, RuntimeError> {
        let (behaviour, destination, deleted) = match self.jobs.get(&handle.name) {
            Some(job) => (
                job.behaviour.clone(),
                job.destination.clone(),
                Arc::clone(&job.deleted),
            ),
            None => return Ok(JobExit::Vanished),
        };

        Ok(match behaviour {
            Behaviour::Succeed => {
                let destination = destination.unwrap_or_default();
                let digest = format!("sha256:{}", sha256_hex(destination.as_bytes()));
                if let Some((repository, tag)) = destination.rsplit_once(':') {
                    self.registry.publish(&ImageRef::new(repository, tag), &digest);
                }
                JobExit::Succeeded {
                    digest: Some(digest),
                }
            }
            Behaviour::SucceedWithoutDigest => JobExit::Succeeded { digest: None },
            Behaviour::Fail {
                exit_code,
                log_tail,
            } => JobExit::Failed {
                exit_code,
                log_tail,
            },
            Behaviour::Kill { exit_code, oom } => JobExit::Killed { exit_code, oom },
            Behaviour::Hang => {
                deleted.notified().await;
                JobExit::Vanished
            }
            Behaviour::Vanish | Behaviour::Refuse => JobExit::Vanished,
        })
    }

    async fn delete(&self, handle: &JobHandle) -> Result<(), RuntimeError> {
        if let Some(job) = self.jobs.get(&handle.name) {
            job.deleted.notify_one();
        }
        let mut deleted = self.deleted.lock().unwrap();
        if !deleted.contains(&handle.name) {
            deleted.push(handle.name.clone());
        }
        Ok(())
    }

    async fn logs(&self, _handle: &JobHandle, _tail: usize) -> Result<String, RuntimeError> {
        Ok(String::new())
    }
}

// ============================================================================
// Status sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StatusEvent>>,
    failures: AtomicU32,
    rejecting: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn reject_all(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("400 Bad Request".to_string()));
        }
        if take(&self.failures) {
            return Err(SinkError::Transient("503 Service Unavailable".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Wired builder
// ============================================================================

/// A builder wired to fakes, with its workers running
pub struct Fixture {
    pub store: Arc<MemoryObjectStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub runtime: Arc<FakeRuntime>,
    pub sink: Arc<RecordingSink>,
    pub cancellations: Arc<Cancellations>,
    pub tracker: Arc<JobTracker>,
    pub pipeline: Arc<BuildPipeline>,
    pub receiver: Arc<EventReceiver>,
    _workers: Vec<JoinHandle<()>>,
    _parked: Option<mpsc::Receiver<WorkItem>>,
    dir: tempfile::TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::wire(config, true)
    }

    /// A builder without workers; accepted builds stay queued
    pub async fn idle(capacity: usize) -> Self {
        let mut config = test_config();
        config.queue_capacity = capacity;
        Self::wire(config, false)
    }

    fn wire(mut config: Config, start_workers: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.workspace_base = dir.path().to_path_buf();

        let store = Arc::new(MemoryObjectStore::new());
        let registry = Arc::new(FakeRegistry::new());
        let runtime = Arc::new(FakeRuntime::new(registry.clone()));
        let sink = Arc::new(RecordingSink::new());
        let cancellations = Arc::new(Cancellations::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let tracker = Arc::new(JobTracker::new(jobs.clone()));

        let backoff = Backoff::with_attempts(config.storage_attempts);
        let objects = ObjectStoreClient::new(store.clone(), backoff, config.io_timeout);
        let orchestrator = Arc::new(JobOrchestrator::new(
            &config,
            runtime.clone(),
            registry.clone(),
            JobTemplate::load(None).unwrap(),
            cancellations.clone(),
        ));

        let pipeline = Arc::new(BuildPipeline::new(
            tracker.clone(),
            BuildContextAssembler::new(
                objects.clone(),
                config.workspace_base.clone(),
                config.base_image.clone(),
                config.max_source_bytes,
            ),
            orchestrator.clone(),
            ArtifactPublisher::new(objects, registry.clone(), config.io_timeout),
            StatusEmitter::new(
                sink.clone(),
                backoff,
                config.io_timeout,
                config.event_source.clone(),
            ),
            cancellations.clone(),
            backoff,
            config.run_timeout,
        ));

        let (dispatcher, rx) = Dispatcher::new(config.queue_capacity);
        let (workers, parked) = if start_workers {
            let workers = spawn_workers(
                config.worker_count,
                rx,
                dispatcher.queue(),
                pipeline.clone(),
            );
            (workers, None)
        } else {
            (Vec::new(), Some(rx))
        };
        let receiver = Arc::new(EventReceiver::new(
            tracker.clone(),
            dispatcher,
            cancellations.clone(),
            orchestrator,
        ));

        Self {
            store,
            jobs,
            runtime,
            sink,
            cancellations,
            tracker,
            pipeline,
            receiver,
            _workers: workers,
            _parked: parked,
            dir,
        }
    }

    /// Base directory of build workspaces
    pub fn workspace(&self) -> &Path {
        self.dir.path()
    }

    /// Status events once at least `count` were delivered
    ///
    /// Announcements follow the recorded terminal state, so a handle can
    /// settle slightly before its event goes out.
    pub async fn announced(&self, count: usize) -> Vec<StatusEvent> {
        for _ in 0..1000 {
            let events = self.sink.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.sink.events()
    }
}
