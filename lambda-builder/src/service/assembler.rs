//! Build context assembly
//!
//! Downloads the parser source and lays out a self-contained workspace:
//!
//! ```text
//! {workspace_base}/{job_id}/
//!   parser.js        uploaded source
//!   index.js         Lambda handler wrapping the parser
//!   Dockerfile       rendered with the configured base image
//!   context.tar.gz   the three files above, packed deterministically
//! ```

use flate2::Compression;
use flate2::write::GzEncoder;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lambda_core::domain::{BuildJob, ContentHash, ErrorKind, sha256_hex};

use super::StageFailure;
use crate::deadline::Deadline;
use crate::retry::Attempted;
use crate::storage::{ObjectStoreClient, StoreError};

const DOCKERFILE_TEMPLATE: &str = include_str!("../../templates/Dockerfile.tmpl");
const WRAPPER_HARNESS: &str = include_str!("../../templates/index.js");

pub const ARCHIVE_NAME: &str = "context.tar.gz";
pub const DIGEST_FILE_NAME: &str = "digest";

/// Ephemeral workspace of one build run
///
/// Removed by [`BuildContext::cleanup`], or on drop if the run never got
/// that far.
#[derive(Debug)]
pub struct BuildContext {
    pub job_id: Uuid,
    pub dir: PathBuf,
    pub archive_path: PathBuf,
    pub archive_sha256: String,
    pub content_hash: ContentHash,
    removed: bool,
}

impl BuildContext {
    pub async fn read_archive(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.archive_path).await
    }

    /// Host path the builder writes the pushed digest to
    pub fn digest_file(&self) -> PathBuf {
        self.dir.join(DIGEST_FILE_NAME)
    }

    pub async fn cleanup(mut self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!("Removed workspace {}", self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.dir.display(), e),
        }
        self.removed = true;
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

pub struct BuildContextAssembler {
    objects: ObjectStoreClient,
    workspace_base: PathBuf,
    base_image: String,
    max_source_bytes: u64,
}

impl BuildContextAssembler {
    pub fn new(
        objects: ObjectStoreClient,
        workspace_base: PathBuf,
        base_image: String,
        max_source_bytes: u64,
    ) -> Self {
        Self {
            objects,
            workspace_base,
            base_image,
            max_source_bytes,
        }
    }

    pub fn render_dockerfile(&self) -> String {
        DOCKERFILE_TEMPLATE.replace("{{base_image}}", &self.base_image)
    }

    /// Builds the context for `job`
    ///
    /// Missing, empty and oversize sources are `DownloadError`; failures
    /// writing the workspace are `InfraError`.
    pub async fn assemble(
        &self,
        job: &BuildJob,
        deadline: &Deadline,
    ) -> Attempted<BuildContext, StageFailure> {
        let key = job.key();
        let source_key = key.source_key();

        let download = self.objects.download(&source_key, deadline).await;
        let attempts = download.attempts;
        let fail = |kind, message: String| Attempted {
            attempts,
            result: Err(StageFailure::new(kind, message)),
        };

        let source = match download.result {
            Ok(source) => source,
            Err(StoreError::NotFound(_)) => {
                return fail(
                    ErrorKind::DownloadError,
                    format!("parser source {} not found", source_key),
                );
            }
            Err(e) => {
                return fail(
                    ErrorKind::DownloadError,
                    format!("download of {} failed after {} attempt(s): {}", source_key, attempts, e),
                );
            }
        };

        if source.is_empty() {
            return fail(
                ErrorKind::DownloadError,
                format!("parser source {} is empty", source_key),
            );
        }
        if source.len() as u64 > self.max_source_bytes {
            return fail(
                ErrorKind::DownloadError,
                format!(
                    "parser source {} is {} bytes, limit is {}",
                    source_key,
                    source.len(),
                    self.max_source_bytes
                ),
            );
        }

        let dockerfile = self.render_dockerfile();
        let files = vec![
            ("Dockerfile".to_string(), dockerfile.into_bytes()),
            ("index.js".to_string(), WRAPPER_HARNESS.as_bytes().to_vec()),
            ("parser.js".to_string(), source),
        ];
        let content_hash =
            ContentHash::of_inputs(files.iter().map(|(name, data)| (name.as_str(), data.as_slice())));

        let dir = self.workspace_base.join(job.job_id.to_string());
        let workspace = dir.clone();
        let written = tokio::task::spawn_blocking(move || write_workspace(&workspace, &files)).await;

        let archive = match written {
            Ok(Ok(archive)) => archive,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return fail(
                    ErrorKind::InfraError,
                    format!("failed to write workspace {}: {}", dir.display(), e),
                );
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return fail(ErrorKind::InfraError, format!("workspace task failed: {}", e));
            }
        };

        info!(
            "Assembled context for {} ({}) in {} [content {}]",
            key,
            job.request_id(),
            dir.display(),
            content_hash.tag()
        );

        Attempted {
            attempts,
            result: Ok(BuildContext {
                job_id: job.job_id,
                archive_path: dir.join(ARCHIVE_NAME),
                dir,
                archive_sha256: sha256_hex(&archive),
                content_hash,
                removed: false,
            }),
        }
    }
}

/// Writes the context files and their archive, returning the archive bytes
fn write_workspace(dir: &Path, files: &[(String, Vec<u8>)]) -> io::Result<Vec<u8>> {
    std::fs::create_dir_all(dir)?;
    for (name, data) in files {
        std::fs::write(dir.join(name), data)?;
    }

    let archive = pack(files)?;
    std::fs::write(dir.join(ARCHIVE_NAME), &archive)?;
    Ok(archive)
}

/// Packs files into a reproducible tar.gz: sorted entries, fixed metadata
pub(crate) fn pack(files: &[(String, Vec<u8>)]) -> io::Result<Vec<u8>> {
    let mut sorted: Vec<&(String, Vec<u8>)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);

    for (name, data) in sorted {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        archive.append_data(&mut header, name, data.as_slice())?;
    }

    archive.into_inner()?.finish()
}
