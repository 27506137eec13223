//! Build job orchestration
//!
//! Turns a build context into a pushed image:
//! - skips the build when the registry already holds the content-hash tag
//! - waits for a global capacity permit, within the run deadline or until
//!   the build is cancelled
//! - renders and submits the job, then watches it to completion
//! - deletes jobs that overrun their timeout or are cancelled
//! - retries infrastructure failures once
//!
//! Finished jobs are kept for `job_ttl` for inspection and then deleted.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use lambda_core::domain::{BuildJob, ErrorKind, ImageRef};

use super::StageFailure;
use super::assembler::{ARCHIVE_NAME, BuildContext, DIGEST_FILE_NAME};
use super::cancel::Cancellations;
use crate::config::{Config, ResourceLimits};
use crate::deadline::Deadline;
use crate::registry::{RegistryClient, resolve_image};
use crate::retry::{Attempted, Backoff};
use crate::runtime::{
    JobExit, JobHandle, JobResources, JobRuntime, JobSpec, JobTemplate, Mount, TemplateParams,
};

const WORKSPACE_MOUNT: &str = "/workspace";
const AUTH_MOUNT: &str = "/kaniko/.docker";

/// Retries after an infrastructure failure
const INFRA_RETRIES: u32 = 1;

/// Image produced (or found) for a build context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Content-hash tagged reference, with the pushed digest
    pub image: ImageRef,
    /// True when the registry already had the image and no job ran
    pub reused: bool,
}

pub struct JobOrchestrator {
    runtime: Arc<dyn JobRuntime>,
    registry: Arc<dyn RegistryClient>,
    template: JobTemplate,
    capacity: Arc<Semaphore>,
    cancellations: Arc<Cancellations>,
    /// Submitted jobs by request id, for cancellation
    running: DashMap<String, JobHandle>,
    backoff: Backoff,
    registry_prefix: String,
    builder_image: String,
    resources: ResourceLimits,
    registry_auth_dir: Option<PathBuf>,
    registry_insecure: bool,
    build_timeout: Duration,
    io_timeout: Duration,
    job_ttl: Duration,
}

impl JobOrchestrator {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn JobRuntime>,
        registry: Arc<dyn RegistryClient>,
        template: JobTemplate,
        cancellations: Arc<Cancellations>,
    ) -> Self {
        Self {
            runtime,
            registry,
            template,
            capacity: Arc::new(Semaphore::new(config.max_concurrent_builds)),
            cancellations,
            running: DashMap::new(),
            backoff: Backoff::with_attempts(config.storage_attempts),
            registry_prefix: config.registry.trim_end_matches('/').to_string(),
            builder_image: config.builder_image.clone(),
            resources: config.resources.clone(),
            registry_auth_dir: config.registry_auth_dir.clone(),
            registry_insecure: config.registry_insecure,
            build_timeout: config.build_timeout,
            io_timeout: config.io_timeout,
            job_ttl: config.job_ttl,
        }
    }

    /// Target image of a build: one repository per key, tagged by content
    pub fn image_for(&self, job: &BuildJob, context: &BuildContext) -> ImageRef {
        ImageRef::new(
            format!("{}/{}", self.registry_prefix, job.key().repository_name()),
            context.content_hash.tag(),
        )
    }

    /// Builds currently holding a capacity permit
    pub fn active_builds(&self) -> usize {
        self.running.len()
    }

    pub async fn build(
        &self,
        job: &BuildJob,
        context: &BuildContext,
        deadline: &Deadline,
    ) -> Attempted<BuiltImage, StageFailure> {
        let image = self.image_for(job, context);

        let existing = resolve_image(
            self.registry.as_ref(),
            &self.backoff,
            self.io_timeout,
            &image,
            deadline,
        )
        .await;
        match existing.result {
            Ok(Some(digest)) => {
                info!(
                    "Image {} already exists ({}), skipping build for {}",
                    image.tagged(),
                    digest,
                    job.request_id()
                );
                return Attempted {
                    attempts: 0,
                    result: Ok(BuiltImage {
                        image: image.with_digest(digest),
                        reused: true,
                    }),
                };
            }
            Ok(None) => {}
            Err(e) => warn!(
                "Could not check registry for {}, building anyway: {}",
                image.tagged(),
                e
            ),
        }

        let acquired = tokio::select! {
            acquired = deadline.bound(deadline.remaining(), self.capacity.acquire()) => acquired,
            _ = self.cancellations.cancelled(job.request_id()) => {
                info!("Request {} cancelled while waiting for build capacity", job.request_id());
                return Attempted {
                    attempts: 0,
                    result: Err(StageFailure::new(ErrorKind::CancelledError, "build cancelled")),
                };
            }
        };
        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Attempted::once(Err(StageFailure::new(
                    ErrorKind::InfraError,
                    "build capacity is shut down",
                )));
            }
            Err(_) => {
                return Attempted {
                    attempts: 0,
                    result: Err(StageFailure::new(
                        ErrorKind::TimeoutError,
                        "deadline passed while waiting for build capacity",
                    )),
                };
            }
        };

        let mut attempt = 0;
        let result = loop {
            attempt += 1;

            if self.cancellations.is_requested(job.request_id()) {
                break Err(StageFailure::new(ErrorKind::CancelledError, "build cancelled"));
            }

            let outcome = match self.job_spec(job, context, &image, attempt) {
                Ok(spec) => self.run_job(job, &spec, deadline).await,
                Err(failure) => Err(failure),
            };

            match outcome {
                Err(failure) if failure.kind == ErrorKind::InfraError && attempt <= INFRA_RETRIES => {
                    warn!(
                        "Build attempt {} for {} hit an infrastructure failure, retrying: {}",
                        attempt,
                        job.request_id(),
                        failure.message
                    );
                }
                Err(failure) => break Err(failure),
                Ok(digest) => {
                    break Ok(BuiltImage {
                        image: image.clone().with_digest(digest),
                        reused: false,
                    });
                }
            }
        };
        drop(permit);

        Attempted {
            attempts: attempt,
            result,
        }
    }

    fn job_spec(
        &self,
        job: &BuildJob,
        context: &BuildContext,
        image: &ImageRef,
        attempt: u32,
    ) -> Result<JobSpec, StageFailure> {
        let name = format!("lb-{}-{}", job.job_id.simple(), attempt);
        let tagged = image.tagged();
        let archive = format!("{}/{}", WORKSPACE_MOUNT, ARCHIVE_NAME);
        let digest_file = format!("{}/{}", WORKSPACE_MOUNT, DIGEST_FILE_NAME);

        let rendered = self
            .template
            .render(&TemplateParams {
                builder_image: &self.builder_image,
                context: &archive,
                image: &tagged,
                digest_file: &digest_file,
                job_name: &name,
                resources: &self.resources,
            })
            .map_err(|e| StageFailure::new(ErrorKind::InfraError, e.to_string()))?;

        let mut args = rendered.args;
        if self.registry_insecure {
            args.push("--insecure".to_string());
        }

        let mut mounts = vec![Mount {
            host: context.dir.clone(),
            container: WORKSPACE_MOUNT.to_string(),
            read_only: false,
        }];
        if let Some(auth) = &self.registry_auth_dir {
            mounts.push(Mount {
                host: auth.clone(),
                container: AUTH_MOUNT.to_string(),
                read_only: true,
            });
        }

        let labels = BTreeMap::from([
            ("lambda-builder.request".to_string(), job.request_id().to_string()),
            ("lambda-builder.job".to_string(), job.job_id.to_string()),
            ("lambda-builder.key".to_string(), job.key().to_string()),
        ]);

        Ok(JobSpec {
            name,
            image: rendered.image,
            args,
            env: rendered.env,
            resources: JobResources {
                cpus: rendered.resources.cpus,
                memory: rendered.resources.memory,
                memory_reservation: rendered.resources.memory_reservation,
            },
            labels,
            mounts,
            digest_file: context.digest_file(),
        })
    }

    /// Submits one job and watches it; returns the pushed digest
    async fn run_job(
        &self,
        job: &BuildJob,
        spec: &JobSpec,
        deadline: &Deadline,
    ) -> Result<String, StageFailure> {
        let request_id = job.request_id();
        let _ = tokio::fs::remove_file(&spec.digest_file).await;

        let handle = match deadline.bound(self.io_timeout, self.runtime.submit(spec)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(StageFailure::new(
                    ErrorKind::InfraError,
                    format!("job {} could not be started: {}", spec.name, e),
                ));
            }
            Err(_) => {
                return Err(StageFailure::new(
                    ErrorKind::InfraError,
                    format!("job {} submission timed out", spec.name),
                ));
            }
        };
        self.running.insert(request_id.to_string(), handle.clone());

        // A cancel that arrived while submitting found nothing to delete
        if self.cancellations.is_requested(request_id) {
            self.abort(request_id).await;
        }

        info!("Watching job {} for request {}", handle.name, request_id);
        let waited = deadline.bound(self.build_timeout, self.runtime.wait(&handle)).await;
        // Gone from the map means `abort` already deleted the job
        let aborted = self.running.remove(request_id).is_none();

        let exit = match waited {
            Err(elapsed) => {
                self.delete_now(&handle).await;
                return Err(StageFailure::new(
                    ErrorKind::TimeoutError,
                    format!("job {} exceeded {:?} and was deleted", handle.name, elapsed.0),
                ));
            }
            Ok(Err(e)) => {
                self.delete_later(handle);
                return Err(StageFailure::new(
                    ErrorKind::InfraError,
                    format!("lost track of job: {}", e),
                ));
            }
            Ok(Ok(exit)) => exit,
        };

        if self.cancellations.is_requested(request_id) {
            if !aborted {
                self.delete_now(&handle).await;
            }
            return Err(StageFailure::new(ErrorKind::CancelledError, "build cancelled"));
        }

        debug!("Job {} finished: {:?}", handle.name, exit);
        self.delete_later(handle);
        classify(exit)
    }

    /// Deletes the running job of `request_id`; false when none is running
    pub async fn abort(&self, request_id: &str) -> bool {
        let Some((_, handle)) = self.running.remove(request_id) else {
            return false;
        };
        info!("Deleting job {} for cancelled request {}", handle.name, request_id);
        self.delete_now(&handle).await;
        true
    }

    async fn delete_now(&self, handle: &JobHandle) {
        match tokio::time::timeout(self.io_timeout, self.runtime.delete(handle)).await {
            Ok(Ok(())) => debug!("Deleted job {}", handle.name),
            Ok(Err(e)) => error!("Failed to delete job {}: {}", handle.name, e),
            Err(_) => error!("Timed out deleting job {}", handle.name),
        }
    }

    /// Deletes a finished job once its retention TTL has passed
    fn delete_later(&self, handle: JobHandle) {
        let runtime = Arc::clone(&self.runtime);
        let ttl = self.job_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            match runtime.delete(&handle).await {
                Ok(()) => debug!("Job {} removed after TTL", handle.name),
                Err(e) => warn!("Failed to remove job {} after TTL: {}", handle.name, e),
            }
        });
    }
}

/// Maps a job exit to the pushed digest or a failure
pub(crate) fn classify(exit: JobExit) -> Result<String, StageFailure> {
    match exit {
        JobExit::Succeeded {
            digest: Some(digest),
        } => Ok(digest),
        JobExit::Succeeded { digest: None } => Err(StageFailure::new(
            ErrorKind::InfraError,
            "builder exited successfully without reporting a digest",
        )),
        JobExit::Failed {
            exit_code: exit_code @ 125..=127,
            ..
        } => Err(StageFailure::new(
            ErrorKind::InfraError,
            format!("runtime could not start the builder (exit {})", exit_code),
        )),
        JobExit::Failed {
            exit_code,
            log_tail,
        } => Err(StageFailure::new(
            ErrorKind::BuildError,
            format!("builder exited with code {}: {}", exit_code, log_tail.trim()),
        )),
        JobExit::Killed {
            exit_code,
            oom: true,
        } => Err(StageFailure::new(
            ErrorKind::InfraError,
            format!("builder was killed for exceeding its memory limit (exit {})", exit_code),
        )),
        JobExit::Killed { exit_code, .. } => Err(StageFailure::new(
            ErrorKind::InfraError,
            format!("builder was killed by a signal (exit {})", exit_code),
        )),
        JobExit::Vanished => Err(StageFailure::new(
            ErrorKind::InfraError,
            "build job disappeared before reporting a result",
        )),
    }
}
