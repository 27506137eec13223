//! Directory-backed object store for local runs

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ObjectStore, StoreError, validate_key};

/// Filesystem implementation of ObjectStore
///
/// Each object is a file under `root`; keys map directly to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        let path = self.root.join(key);

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(StoreError::rejected(key, e)),
            Err(e) => Err(StoreError::unavailable(key, e)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        let path = self.root.join(key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::unavailable(key, e))?;
        }

        // Write then rename so readers never see a partial object
        let staging = path.with_extension(format!("partial-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, &body)
            .await
            .map_err(|e| StoreError::unavailable(key, e))?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StoreError::unavailable(key, e));
        }

        debug!("Stored {} ({} bytes) under {}", key, body.len(), self.root.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;

        match tokio::fs::remove_file(self.root.join(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::unavailable(key, e)),
        }
    }
}
