//! Object storage layer
//!
//! Adapters are thin and stateless: they move bytes and classify failures.
//! Retries, deadlines and checksums live in [`ObjectStoreClient`].
//!
//! All adapters are trait-based to enable testing and mocking.

mod client;
mod fs;
mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::Retryable;

pub use client::ObjectStoreClient;
pub use fs::FsObjectStore;
pub use http::HttpObjectStore;

/// Object storage failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The object does not exist
    #[error("object {0} not found")]
    NotFound(String),

    /// Network blip, throttling or server-side failure
    #[error("storage request for {key} failed: {message}")]
    Unavailable { key: String, message: String },

    /// The store refused the request (permissions, bad key)
    #[error("storage rejected request for {key}: {message}")]
    Rejected { key: String, message: String },

    #[error("storage request for {key} timed out")]
    Timeout { key: String },
}

impl StoreError {
    pub fn unavailable(key: &str, message: impl ToString) -> Self {
        Self::Unavailable {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub fn rejected(key: &str, message: impl ToString) -> Self {
        Self::Rejected {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } | StoreError::Timeout { .. } => true,
            StoreError::NotFound(_) | StoreError::Rejected { .. } => false,
        }
    }
}

/// Byte-level access to a bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads a whole object
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Writes a whole object, replacing any previous content
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StoreError>;

    /// Removes an object; deleting a missing object is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Rejects keys that could escape the bucket or tenant prefix
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StoreError::rejected(key, "invalid object key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("acme/csv-v1.js").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/acme/csv.js").is_err());
        assert!(validate_key("acme/../other/csv.js").is_err());
        assert!(validate_key("acme//csv.js").is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(StoreError::unavailable("k", "503").is_transient());
        assert!(
            StoreError::Timeout {
                key: "k".to_string()
            }
            .is_transient()
        );
        assert!(!StoreError::NotFound("k".to_string()).is_transient());
        assert!(!StoreError::rejected("k", "403").is_transient());
    }
}
