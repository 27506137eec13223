//! Container registry lookups
//!
//! Only manifest existence is needed: the builder pushes images itself, the
//! service just asks the registry which digest a tag points at.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use lambda_core::domain::ImageRef;

use crate::deadline::Deadline;
use crate::retry::{Attempted, Backoff, Retryable};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry rejected request: {0}")]
    Rejected(String),

    #[error("invalid image reference '{0}'")]
    InvalidReference(String),
}

impl Retryable for RegistryError {
    fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Digest the image's tag currently points at, None when absent
    async fn resolve(&self, image: &ImageRef) -> Result<Option<String>, RegistryError>;
}

/// Resolves with the caller's deadline, per-call timeout and retry policy
pub async fn resolve_image(
    registry: &dyn RegistryClient,
    backoff: &Backoff,
    io_timeout: Duration,
    image: &ImageRef,
    deadline: &Deadline,
) -> Attempted<Option<String>, RegistryError> {
    let label = format!("resolve {}", image.tagged());
    backoff
        .run(deadline, &label, || async move {
            deadline
                .bound(io_timeout, registry.resolve(image))
                .await
                .unwrap_or_else(|e| Err(RegistryError::Unavailable(e.to_string())))
        })
        .await
}

/// OCI distribution API client
pub struct HttpRegistry {
    client: Client,
    token: Option<String>,
    insecure: bool,
}

impl HttpRegistry {
    /// # Arguments
    /// * `token` - Optional bearer token for pull access
    /// * `insecure` - Use plain HTTP (local development registries)
    pub fn new(token: Option<String>, insecure: bool) -> Self {
        Self {
            client: Client::new(),
            token,
            insecure,
        }
    }

    fn manifest_url(&self, image: &ImageRef) -> Result<String, RegistryError> {
        let (host, path) = image
            .repository
            .split_once('/')
            .filter(|(host, path)| !host.is_empty() && !path.is_empty())
            .ok_or_else(|| RegistryError::InvalidReference(image.repository.clone()))?;
        let scheme = if self.insecure { "http" } else { "https" };
        Ok(format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, host, path, image.tag
        ))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    async fn resolve(&self, image: &ImageRef) -> Result<Option<String>, RegistryError> {
        let url = self.manifest_url(image)?;
        debug!("HEAD {}", url);

        let mut request = self
            .client
            .head(&url)
            .header(header::ACCEPT, MANIFEST_MEDIA_TYPES);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RegistryError::Unavailable(format!("{} for {}", status, url)));
        }
        if !status.is_success() {
            return Err(RegistryError::Rejected(format!("{} for {}", status, url)));
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                RegistryError::Rejected(format!("{} missing from response for {}", DIGEST_HEADER, url))
            })?;

        Ok(Some(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;

    #[test]
    fn test_manifest_url() {
        let image = ImageRef::new("registry.example.com/lambdas/acme/csv-v1", "0123456789ab");

        assert_eq!(
            HttpRegistry::new(None, false).manifest_url(&image).unwrap(),
            "https://registry.example.com/v2/lambdas/acme/csv-v1/manifests/0123456789ab"
        );
        assert_eq!(
            HttpRegistry::new(None, true).manifest_url(&image).unwrap(),
            "http://registry.example.com/v2/lambdas/acme/csv-v1/manifests/0123456789ab"
        );
    }

    #[test]
    fn test_reference_without_host_is_invalid() {
        let image = ImageRef::new("acme-csv-v1", "latest");
        assert!(matches!(
            HttpRegistry::new(None, false).manifest_url(&image),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_image_retries_unavailable_registry() {
        let registry = FakeRegistry::new();
        let image = ImageRef::new("registry.example.com/lambdas/acme/csv-v1", "0123456789ab");
        registry.publish(&image, "sha256:feed");
        registry.fail_next(1);

        let deadline = Deadline::after(Duration::from_secs(60));
        let outcome = resolve_image(
            &registry,
            &Backoff::default(),
            Duration::from_secs(1),
            &image,
            &deadline,
        )
        .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result, Ok(Some("sha256:feed".to_string())));
    }
}
