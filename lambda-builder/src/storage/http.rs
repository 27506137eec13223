//! S3-compatible HTTP object store
//!
//! Path-style addressing: `{endpoint}/{bucket}/{key}`. Credentials are a
//! bearer token, as issued by the storage gateway in front of the bucket.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{ObjectStore, StoreError, validate_key};

/// HTTP implementation of ObjectStore
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    region: String,
    bucket: String,
    token: Option<String>,
}

impl HttpObjectStore {
    /// Creates a new HTTP object store
    ///
    /// # Arguments
    /// * `endpoint` - Base URL (e.g., "https://s3.eu-west-1.amazonaws.com")
    /// * `region` - Bucket region, sent with every request
    /// * `bucket` - Bucket holding sources and artifacts
    /// * `token` - Optional bearer token
    pub fn new(endpoint: String, region: String, bucket: String, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region,
            bucket,
            token,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn request(&self, method: reqwest::Method, key: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, self.object_url(key))
            .header("x-amz-bucket-region", &self.region);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }
}

/// Maps a non-success status to a store error
fn classify(key: &str, status: StatusCode, body: String) -> StoreError {
    if status == StatusCode::NOT_FOUND {
        StoreError::NotFound(key.to_string())
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StoreError::unavailable(key, format!("{} - {}", status, body))
    } else {
        StoreError::rejected(key, format!("{} - {}", status, body))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        debug!("GET object {}/{}", self.bucket, key);

        let response = self
            .request(reqwest::Method::GET, key)
            .send()
            .await
            .map_err(|e| StoreError::unavailable(key, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify(key, status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::unavailable(key, e))?;

        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        debug!("PUT object {}/{} ({} bytes)", self.bucket, key, body.len());

        let response = self
            .request(reqwest::Method::PUT, key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::unavailable(key, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify(key, status, body));
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        debug!("DELETE object {}/{}", self.bucket, key);

        let response = self
            .request(reqwest::Method::DELETE, key)
            .send()
            .await
            .map_err(|e| StoreError::unavailable(key, e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(key, status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url() {
        let store = HttpObjectStore::new(
            "https://s3.eu-west-1.amazonaws.com/".to_string(),
            "eu-west-1".to_string(),
            "parsers".to_string(),
            None,
        );
        assert_eq!(
            store.object_url("acme/csv-v1.js"),
            "https://s3.eu-west-1.amazonaws.com/parsers/acme/csv-v1.js"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify("k", StatusCode::NOT_FOUND, String::new()),
            StoreError::NotFound("k".to_string())
        );
        assert!(matches!(
            classify("k", StatusCode::SERVICE_UNAVAILABLE, String::new()),
            StoreError::Unavailable { .. }
        ));
        assert!(matches!(
            classify("k", StatusCode::TOO_MANY_REQUESTS, String::new()),
            StoreError::Unavailable { .. }
        ));
        assert!(matches!(
            classify("k", StatusCode::FORBIDDEN, String::new()),
            StoreError::Rejected { .. }
        ));
    }
}
