//! Artifact publishing
//!
//! Uploads the packaged source next to the parser source and confirms the
//! image the builder pushed. Both are named by content, so publishing the
//! same context twice leaves the store and the registry unchanged.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use lambda_core::domain::{Artifact, BuildJob, ErrorKind};

use super::StageFailure;
use super::assembler::BuildContext;
use super::orchestrator::BuiltImage;
use crate::deadline::Deadline;
use crate::registry::{RegistryClient, resolve_image};
use crate::retry::{Attempted, Backoff};
use crate::storage::ObjectStoreClient;

pub struct ArtifactPublisher {
    objects: ObjectStoreClient,
    registry: Arc<dyn RegistryClient>,
    backoff: Backoff,
    io_timeout: Duration,
}

impl ArtifactPublisher {
    pub fn new(
        objects: ObjectStoreClient,
        registry: Arc<dyn RegistryClient>,
        io_timeout: Duration,
    ) -> Self {
        let backoff = objects.backoff();
        Self {
            objects,
            registry,
            backoff,
            io_timeout,
        }
    }

    /// Publishes the archive of `context` and confirms `built`
    ///
    /// # Arguments
    /// * `job` - Build being published, for the object keys
    /// * `context` - Assembled context holding the archive
    /// * `built` - Image reported by the orchestrator
    /// * `deadline` - Run deadline bounding every store and registry call
    pub async fn publish(
        &self,
        job: &BuildJob,
        context: &BuildContext,
        built: &BuiltImage,
        deadline: &Deadline,
    ) -> Attempted<Artifact, StageFailure> {
        let key = job.key().archive_key();

        let archive = match context.read_archive().await {
            Ok(archive) => archive,
            Err(e) => {
                return Attempted::once(Err(StageFailure::new(
                    ErrorKind::InfraError,
                    format!("could not read packaged context: {}", e),
                )));
            }
        };

        let upload = self.upload_verified(&key, &archive, &context.archive_sha256, deadline).await;
        let mut attempts = upload.attempts;
        let written = match upload.result {
            Ok(written) => written,
            Err(failure) => {
                return Attempted {
                    attempts,
                    result: Err(failure),
                };
            }
        };

        if written {
            let sidecar = checksum_sidecar(&context.archive_sha256, &job.request.parser_id);
            let stored = self
                .objects
                .upload(&format!("{}.sha256", key), sidecar.as_bytes(), deadline)
                .await;
            attempts += stored.attempts;
            if let Err(e) = stored.result {
                return Attempted {
                    attempts,
                    result: Err(StageFailure::new(
                        ErrorKind::PublishError,
                        format!("could not record checksum of {}: {}", key, e),
                    )),
                };
            }
        }

        let confirmed = self.confirm_image(built, deadline).await;
        attempts += confirmed.attempts;
        let image = match confirmed.result {
            Ok(()) => built.image.clone(),
            Err(failure) => {
                return Attempted {
                    attempts,
                    result: Err(failure),
                };
            }
        };

        info!(
            "Published {} ({}) and {} for request {}",
            key,
            if written { "written" } else { "unchanged" },
            image,
            job.request_id()
        );
        Attempted {
            attempts,
            result: Ok(Artifact {
                archive_key: key,
                archive_sha256: context.archive_sha256.clone(),
                content_hash: context.content_hash.clone(),
                image,
                written,
            }),
        }
    }

    /// Writes `archive` unless identical content is already stored, then reads
    /// it back until the checksum matches; returns whether anything was written
    async fn upload_verified(
        &self,
        key: &str,
        archive: &[u8],
        sha256: &str,
        deadline: &Deadline,
    ) -> Attempted<bool, StageFailure> {
        let existing = self.objects.checksum_of(key, deadline).await;
        let mut attempts = existing.attempts;
        match existing.result {
            Ok(Some(stored)) if stored == sha256 => {
                debug!("{} already holds {}, skipping upload", key, sha256);
                return Attempted {
                    attempts,
                    result: Ok(false),
                };
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read existing {}, overwriting: {}", key, e),
        }

        let publish_error = |message: String| Err(StageFailure::new(ErrorKind::PublishError, message));

        for round in 1..=self.backoff.max_attempts {
            let upload = self.objects.upload(key, archive, deadline).await;
            attempts += upload.attempts;
            if let Err(e) = upload.result {
                return Attempted {
                    attempts,
                    result: publish_error(format!("upload of {} failed: {}", key, e)),
                };
            }

            let readback = self.objects.checksum_of(key, deadline).await;
            attempts += readback.attempts;
            match readback.result {
                Ok(Some(stored)) if stored == sha256 => {
                    return Attempted {
                        attempts,
                        result: Ok(true),
                    };
                }
                Ok(stored) => warn!(
                    "Checksum mismatch on {} after upload {}/{}: expected {}, found {}",
                    key,
                    round,
                    self.backoff.max_attempts,
                    sha256,
                    stored.as_deref().unwrap_or("nothing")
                ),
                Err(e) => {
                    return Attempted {
                        attempts,
                        result: publish_error(format!("could not verify {}: {}", key, e)),
                    };
                }
            }

            if round < self.backoff.max_attempts {
                tokio::time::sleep(self.backoff.delay_for(round).min(deadline.remaining())).await;
            }
        }

        // Do not leave a corrupt archive where consumers would pick it up
        if let Err(e) = self.objects.remove(key, deadline).await.result {
            error!("Failed to remove corrupt {}: {}", key, e);
        }
        Attempted {
            attempts,
            result: publish_error(format!(
                "checksum of {} still mismatched after {} upload(s)",
                key, self.backoff.max_attempts
            )),
        }
    }

    /// Checks that the registry serves the digest the builder reported
    async fn confirm_image(&self, built: &BuiltImage, deadline: &Deadline) -> Attempted<(), StageFailure> {
        let image = &built.image;
        let resolved = resolve_image(
            self.registry.as_ref(),
            &self.backoff,
            self.io_timeout,
            image,
            deadline,
        )
        .await;

        let result = match (resolved.result, image.digest.as_deref()) {
            (Ok(Some(found)), Some(expected)) if found == expected => Ok(()),
            (Ok(Some(found)), expected) => Err(StageFailure::new(
                ErrorKind::PublishError,
                format!(
                    "{} resolves to {}, builder reported {}",
                    image.tagged(),
                    found,
                    expected.unwrap_or("no digest")
                ),
            )),
            (Ok(None), _) => Err(StageFailure::new(
                ErrorKind::PublishError,
                format!("{} is not in the registry", image.tagged()),
            )),
            (Err(e), _) => Err(StageFailure::new(
                ErrorKind::PublishError,
                format!("could not confirm {}: {}", image.tagged(), e),
            )),
        };

        Attempted {
            attempts: resolved.attempts,
            result,
        }
    }
}

/// `sha256sum`-compatible line for the archive sidecar
fn checksum_sidecar(sha256: &str, parser_id: &str) -> String {
    format!("{}  {}.tar.gz\n", sha256, parser_id)
}
