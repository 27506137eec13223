use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use lambda_core::domain::sha256_hex;

use super::{ObjectStore, StoreError};
use crate::deadline::Deadline;
use crate::retry::{Attempted, Backoff};

/// Retrying, deadline-aware wrapper over an [`ObjectStore`]
///
/// Every call is capped by the configured I/O timeout and by the caller's
/// deadline; transient failures are retried with backoff.
#[derive(Clone)]
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    backoff: Backoff,
    io_timeout: Duration,
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, backoff: Backoff, io_timeout: Duration) -> Self {
        Self {
            store,
            backoff,
            io_timeout,
        }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    async fn bounded<T>(
        &self,
        key: &str,
        deadline: &Deadline,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        deadline
            .bound(self.io_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Timeout {
                    key: key.to_string(),
                })
            })
    }

    /// Downloads a whole object
    pub async fn download(&self, key: &str, deadline: &Deadline) -> Attempted<Vec<u8>, StoreError> {
        let label = format!("download {}", key);
        let outcome = self
            .backoff
            .run(deadline, &label, || async move {
                self.bounded(key, deadline, self.store.get(key)).await
            })
            .await;

        if let Ok(bytes) = &outcome.result {
            debug!("Downloaded {} ({} bytes)", key, bytes.len());
        }
        outcome
    }

    /// Uploads a whole object, overwriting what was there
    pub async fn upload(&self, key: &str, body: &[u8], deadline: &Deadline) -> Attempted<(), StoreError> {
        let label = format!("upload {}", key);
        self.backoff
            .run(deadline, &label, || async move {
                self.bounded(key, deadline, self.store.put(key, body.to_vec()))
                    .await
            })
            .await
    }

    /// SHA-256 of the stored object, or None when it does not exist
    pub async fn checksum_of(
        &self,
        key: &str,
        deadline: &Deadline,
    ) -> Attempted<Option<String>, StoreError> {
        let outcome = self.download(key, deadline).await;
        Attempted {
            attempts: outcome.attempts,
            result: match outcome.result {
                Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
                Err(StoreError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Removes an object, ignoring absence
    pub async fn remove(&self, key: &str, deadline: &Deadline) -> Attempted<(), StoreError> {
        let label = format!("delete {}", key);
        self.backoff
            .run(deadline, &label, || async move {
                self.bounded(key, deadline, self.store.delete(key)).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryObjectStore;

    fn client(store: &Arc<MemoryObjectStore>) -> ObjectStoreClient {
        ObjectStoreClient::new(
            store.clone(),
            Backoff::with_attempts(3),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_retries_transient_failures() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("acme/csv-v1.js", b"module.exports = {}".to_vec());
        store.fail_next(2);

        let deadline = Deadline::after(Duration::from_secs(60));
        let outcome = client(&store).download("acme/csv-v1.js", &deadline).await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), b"module.exports = {}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_object_is_not_retried() {
        let store = Arc::new(MemoryObjectStore::new());
        let deadline = Deadline::after(Duration::from_secs(60));

        let outcome = client(&store).download("acme/none.js", &deadline).await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.result,
            Err(StoreError::NotFound("acme/none.js".to_string()))
        );
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("acme/csv-v1.js", b"x".to_vec());
        store.stall(true);

        let deadline = Deadline::after(Duration::from_secs(60));
        let outcome = client(&store).download("acme/csv-v1.js", &deadline).await;

        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(StoreError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checksum_of_missing_object() {
        let store = Arc::new(MemoryObjectStore::new());
        let deadline = Deadline::after(Duration::from_secs(60));
        let client = client(&store);

        let missing = client.checksum_of("acme/a.tar.gz", &deadline).await;
        assert_eq!(missing.result, Ok(None));

        client
            .upload("acme/a.tar.gz", b"bytes", &deadline)
            .await
            .result
            .unwrap();
        let present = client.checksum_of("acme/a.tar.gz", &deadline).await;
        assert_eq!(present.result, Ok(Some(sha256_hex(b"bytes"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_then_download_is_byte_identical() {
        let store = Arc::new(MemoryObjectStore::new());
        let deadline = Deadline::after(Duration::from_secs(60));
        let client = client(&store);
        let body: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        client
            .upload("acme/blob.tar.gz", &body, &deadline)
            .await
            .result
            .unwrap();
        let back = client.download("acme/blob.tar.gz", &deadline).await;

        assert_eq!(back.result.unwrap(), body);
    }
}
