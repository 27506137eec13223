//! Build pipeline
//!
//! Drives one [`BuildJob`] from Received to a terminal state:
//! Assembling → Building → Publishing → Completed, or Failed from any stage.
//! Every transition is recorded before the next stage starts, the terminal
//! state is recorded before it is announced, and the build context is
//! removed whatever the outcome. A run whose record was already settled by
//! another instance stops without announcing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lambda_core::domain::{BuildJob, BuildStatus, ErrorKind, ImageRef, Stage};

use super::StageFailure;
use super::assembler::{BuildContext, BuildContextAssembler};
use super::cancel::Cancellations;
use super::dispatch::BuildRunner;
use super::emitter::StatusEmitter;
use super::orchestrator::JobOrchestrator;
use super::publisher::ArtifactPublisher;
use super::tracker::JobTracker;
use crate::deadline::Deadline;
use crate::repository::StoreRepoError;
use crate::retry::{Attempted, Backoff};

/// Interval between checks for another instance's active build of a key
const KEY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct BuildPipeline {
    tracker: Arc<JobTracker>,
    assembler: BuildContextAssembler,
    orchestrator: Arc<JobOrchestrator>,
    publisher: ArtifactPublisher,
    emitter: StatusEmitter,
    cancellations: Arc<Cancellations>,
    backoff: Backoff,
    run_timeout: Duration,
}

impl BuildPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<JobTracker>,
        assembler: BuildContextAssembler,
        orchestrator: Arc<JobOrchestrator>,
        publisher: ArtifactPublisher,
        emitter: StatusEmitter,
        cancellations: Arc<Cancellations>,
        backoff: Backoff,
        run_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            assembler,
            orchestrator,
            publisher,
            emitter,
            cancellations,
            backoff,
            run_timeout,
        }
    }

    /// Fails builds whose owner stopped renewing their lease and announces them
    ///
    /// Covers builds of a previous process as well as those of a crashed
    /// instance sharing the store. Builds of live owners, this process
    /// included, are left alone. Returns how many builds were failed.
    pub async fn recover_orphaned(&self, lease: Duration) -> Result<usize, StoreRepoError> {
        let stale_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let orphaned = self.tracker.store().list_orphaned(stale_before).await?;

        let mut recovered = 0;
        for mut job in orphaned {
            warn!(
                "Build {} for request {} was abandoned in {}",
                job.job_id,
                job.request_id(),
                job.status
            );
            if job
                .fail(ErrorKind::InfraError, "build owner stopped before finishing")
                .is_err()
            {
                continue;
            }
            match self.tracker.store().update(&job).await {
                Ok(()) => {
                    recovered += 1;
                    self.emitter.announce(&job).await;
                }
                // Finished or taken over meanwhile
                Err(StoreRepoError::Settled(_) | StoreRepoError::NotFound(_)) => {
                    debug!("Build for request {} settled before recovery", job.request_id());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    /// Runs every stage, returning the published image
    async fn drive(&self, job: &mut BuildJob, deadline: &Deadline) -> Result<ImageRef, StageFailure> {
        self.check_cancelled(job)?;
        self.claim_key(job, deadline).await?;

        let assembled = self.assembler.assemble(job, deadline).await;
        let context = self.count(job, Stage::Assembling, assembled)?;

        let result = self.build_and_publish(job, &context, deadline).await;
        context.cleanup().await;
        result
    }

    async fn build_and_publish(
        &self,
        job: &mut BuildJob,
        context: &BuildContext,
        deadline: &Deadline,
    ) -> Result<ImageRef, StageFailure> {
        self.check_cancelled(job)?;
        self.transition(job, BuildStatus::Building).await?;
        let built = self.orchestrator.build(job, context, deadline).await;
        let built = self.count(job, Stage::Building, built)?;

        self.check_cancelled(job)?;
        self.transition(job, BuildStatus::Publishing).await?;
        let published = self.publisher.publish(job, context, &built, deadline).await;
        let artifact = self.count(job, Stage::Publishing, published)?;

        Ok(artifact.image)
    }

    /// Moves the job to Assembling once no other build of its key is active
    ///
    /// Keys are serialized in-process by the dispatcher. The store refuses
    /// a second active build per key, which also serializes instances
    /// sharing it.
    async fn claim_key(&self, job: &mut BuildJob, deadline: &Deadline) -> Result<(), StageFailure> {
        let key = job.key();
        loop {
            let mut claimed = job.clone();
            claimed
                .advance(BuildStatus::Assembling)
                .map_err(|e| StageFailure::new(ErrorKind::InfraError, e.to_string()))?;

            match self.persist(&claimed).await {
                Ok(()) => {
                    *job = claimed;
                    info!("Request {} is {}", job.request_id(), job.status);
                    return Ok(());
                }
                Err(StoreRepoError::KeyBusy(_)) => {
                    match self.tracker.store().find_active_by_key(&key).await {
                        Ok(Some(active)) => info!(
                            "Request {} waiting for active build {} of {}",
                            job.request_id(),
                            active.request_id(),
                            key
                        ),
                        _ => info!("Request {} waiting for the active build of {}", job.request_id(), key),
                    }
                }
                Err(e) => {
                    return Err(StageFailure::new(
                        ErrorKind::InfraError,
                        format!("could not record build: {}", e),
                    ));
                }
            }

            if deadline.remaining() <= KEY_POLL_INTERVAL {
                return Err(StageFailure::new(
                    ErrorKind::TimeoutError,
                    format!("deadline passed waiting for the active build of {}", key),
                ));
            }
            tokio::select! {
                _ = tokio::time::sleep(KEY_POLL_INTERVAL) => {}
                _ = self.cancellations.cancelled(job.request_id()) => {}
            }
            self.check_cancelled(job)?;
        }
    }

    fn check_cancelled(&self, job: &BuildJob) -> Result<(), StageFailure> {
        if self.cancellations.is_requested(job.request_id()) {
            return Err(StageFailure::new(ErrorKind::CancelledError, "build cancelled"));
        }
        Ok(())
    }

    fn count<T>(
        &self,
        job: &mut BuildJob,
        stage: Stage,
        outcome: Attempted<T, StageFailure>,
    ) -> Result<T, StageFailure> {
        job.attempts.add(stage, outcome.attempts);
        outcome.result
    }

    async fn transition(&self, job: &mut BuildJob, next: BuildStatus) -> Result<(), StageFailure> {
        job.advance(next)
            .map_err(|e| StageFailure::new(ErrorKind::InfraError, e.to_string()))?;
        self.persist(job)
            .await
            .map_err(|e| StageFailure::new(ErrorKind::InfraError, format!("could not record build: {}", e)))?;
        info!("Request {} is {}", job.request_id(), job.status);
        Ok(())
    }

    async fn persist(&self, job: &BuildJob) -> Result<(), StoreRepoError> {
        let deadline = Deadline::after(self.run_timeout);
        let label = format!("record build {}", job.request_id());
        self.backoff
            .run(&deadline, &label, || async move { self.tracker.record(job).await })
            .await
            .result
    }

    /// Records the terminal state, then announces it
    async fn finalize(&self, mut job: BuildJob, result: Result<ImageRef, StageFailure>) -> BuildJob {
        let settled = match result {
            Ok(image) => job.complete(image),
            Err(failure) => {
                error!(
                    "Build for request {} ({}) failed: {}",
                    job.request_id(),
                    job.key(),
                    failure
                );
                job.fail(failure.kind, failure.message)
            }
        };
        if let Err(e) = settled {
            error!("Build {} could not settle: {}", job.request_id(), e);
        }

        match self.persist(&job).await {
            Ok(()) => {}
            Err(StoreRepoError::Settled(_)) => {
                warn!(
                    "Build for request {} was settled by another instance, not announcing",
                    job.request_id()
                );
                self.cancellations.clear(job.request_id());
                return self.adopt_settled(job).await;
            }
            Err(e) => {
                // Observers still learn the outcome; the record is recovered
                // once this process stops renewing its lease
                error!("Failed to record final state of {}: {}", job.request_id(), e);
                self.tracker.notify(&job);
            }
        }
        self.cancellations.clear(job.request_id());

        if let BuildStatus::Completed { image } = &job.status {
            info!("Build for request {} completed: {}", job.request_id(), image);
        }
        self.emitter.announce(&job).await;
        job
    }

    /// Hands the stored outcome to this run's observers
    async fn adopt_settled(&self, job: BuildJob) -> BuildJob {
        match self.tracker.store().find_by_request(job.request_id()).await {
            Ok(Some(stored)) => {
                self.tracker.notify(&stored);
                stored
            }
            Ok(None) => {
                self.tracker.notify(&job);
                job
            }
            Err(e) => {
                error!("Failed to read settled build {}: {}", job.request_id(), e);
                self.tracker.notify(&job);
                job
            }
        }
    }
}

/// Renews this process's build leases and recovers builds of departed owners
///
/// Ticks three times per `lease`.
pub fn spawn_lease_keeper(pipeline: Arc<BuildPipeline>, lease: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lease / 3);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match pipeline.tracker.store().renew_leases(Utc::now()).await {
                Ok(renewed) => debug!("Renewed {} build lease(s)", renewed),
                Err(e) => error!("Failed to renew build leases: {}", e),
            }
            match pipeline.recover_orphaned(lease).await {
                Ok(0) => {}
                Ok(recovered) => warn!("Failed {} build(s) abandoned by their owner", recovered),
                Err(e) => error!("Failed to recover abandoned builds: {}", e),
            }
        }
    })
}

#[async_trait]
impl BuildRunner for BuildPipeline {
    async fn run(&self, mut job: BuildJob) {
        info!("Starting build {} for request {} ({})", job.job_id, job.request_id(), job.key());
        let deadline = Deadline::after(self.run_timeout);
        let result = self.drive(&mut job, &deadline).await;
        self.finalize(job, result).await;
    }
}
