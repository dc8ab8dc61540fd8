//! Blob storage for uploaded document payloads
//!
//! Files are stored content-addressed under `{tenant}/{uuid}/{filename}` in an
//! S3-compatible bucket. Downloads are served through pre-signed URLs so the
//! payload never flows back through the API process.

use crate::config::BlobConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as BlobPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Content types accepted into the bucket
const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
    "text/markdown",
    "text/csv",
];

/// Storage abstraction over the document bucket
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a payload under the given key
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Fetch a payload (worker-side download)
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Produce a pre-signed download URL; missing objects are fatal
    async fn get_presigned(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Remove a payload
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the storage key for an upload
pub fn build_key(tenant: &str, filename: &str) -> String {
    format!("{}/{}/{}", tenant, Uuid::new_v4(), sanitize_filename(filename))
}

/// Strip path separators and control characters from a client filename
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

fn check_payload(bytes: &[u8], content_type: &str, max_bytes: u64) -> Result<()> {
    if bytes.len() as u64 > max_bytes {
        return Err(CoreError::PayloadTooLarge(format!(
            "payload of {} bytes exceeds limit of {} bytes",
            bytes.len(),
            max_bytes
        )));
    }
    if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
        return Err(CoreError::Validation(format!(
            "content type {} is not allowed",
            content_type
        )));
    }
    Ok(())
}

/// S3-compatible blob store
pub struct S3BlobStore {
    store: AmazonS3,
    max_bytes: u64,
}

impl S3BlobStore {
    /// Build a store from configuration
    pub fn new(config: &BlobConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_region(&config.region)
            .with_bucket_name(&config.bucket);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(key) = &config.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &config.secret_key {
            builder = builder.with_secret_access_key(secret);
        }

        let store = builder
            .build()
            .map_err(|e| CoreError::Config(format!("blob store: {}", e)))?;

        Ok(Self {
            store,
            max_bytes: config.max_upload_bytes,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        check_payload(&bytes, content_type, self.max_bytes)?;

        let path = BlobPath::from(key);
        self.store.put(&path, PutPayload::from(bytes)).await?;
        debug!("stored blob {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = BlobPath::from(key);
        let result = self.store.get(&path).await?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn get_presigned(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = BlobPath::from(key);
        // signed URLs are computed locally; probe the object so a missing
        // blob surfaces as NotFound instead of a dead link
        self.store.head(&path).await?;
        let url = self
            .store
            .signed_url(reqwest::Method::GET, &path, ttl)
            .await?;
        Ok(url.to_string())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = BlobPath::from(key);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            // deletion is idempotent
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process blob store used by tests and local development
pub struct InMemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    max_bytes: u64,
}

impl InMemoryBlobStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            max_bytes,
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        check_payload(&bytes, content_type, self.max_bytes)?;
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(key.to_string()))
    }

    async fn get_presigned(&self, key: &str, ttl: Duration) -> Result<String> {
        let objects = self.objects.read().await;
        if !objects.contains_key(key) {
            return Err(CoreError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{}?expires={}", key, ttl.as_secs()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b\nc.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("..."), "unnamed");
    }

    #[test]
    fn test_build_key_shape() {
        let key = build_key("7", "Hiring Policy.pdf");
        let parts: Vec<&str> = key.splitn(3, '/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "7");
        assert!(Uuid::parse_str(parts[1]).is_ok());
        assert_eq!(parts[2], "Hiring Policy.pdf");
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryBlobStore::new(1024);
        store
            .put("7/x/a.txt", b"hello".to_vec(), "text/plain")
            .await
            .unwrap();

        assert_eq!(store.get("7/x/a.txt").await.unwrap(), b"hello");

        let url = store
            .get_presigned("7/x/a.txt", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.contains("expires=3600"));

        store.delete("7/x/a.txt").await.unwrap();
        assert!(matches!(
            store.get("7/x/a.txt").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let store = InMemoryBlobStore::new(4);
        let err = store
            .put("7/x/a.txt", b"too large".to_vec(), "text/plain")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "payload_too_large");
    }

    #[tokio::test]
    async fn test_disallowed_content_type_rejected() {
        let store = InMemoryBlobStore::new(1024);
        let err = store
            .put("7/x/a.bin", b"MZ".to_vec(), "application/x-msdownload")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_presign_missing_object_is_fatal() {
        let store = InMemoryBlobStore::new(1024);
        let err = store
            .get_presigned("7/missing/a.txt", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
