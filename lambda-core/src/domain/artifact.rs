//! Artifact domain types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the content hash prefix used as an image tag
const TAG_LENGTH: usize = 12;

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 over the inputs of a build context
///
/// Each input contributes its name and contents, length-prefixed, in the
/// order given. Identical inputs always hash to the same value, so the hash
/// names both the archive and the image tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_inputs<'a>(inputs: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let mut hasher = Sha256::new();
        for (name, contents) in inputs {
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update((contents.len() as u64).to_be_bytes());
            hasher.update(contents);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used as the image tag
    pub fn tag(&self) -> &str {
        &self.0[..TAG_LENGTH]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a container image in the target registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    /// Registry host and path, e.g. `registry.example.com/lambdas/acme/csv-v1`
    pub repository: String,
    pub tag: String,
    /// Manifest digest reported by the builder (`sha256:...`)
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// `repository:tag`, the reference pushed by the builder
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}:{}@{}", self.repository, self.tag, digest),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

/// Outputs of a successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Object key of the packaged source, `{tenantId}/{parserId}.tar.gz`
    pub archive_key: String,
    pub archive_sha256: String,
    pub content_hash: ContentHash,
    pub image: ImageRef,
    /// False when identical content was already published
    pub written: bool,
}
