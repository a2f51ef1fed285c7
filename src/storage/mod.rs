//! Object storage abstraction for exported artifacts
//! Uses Apache Arrow object_store crate

use object_store::aws::AmazonS3Builder;
use object_store::path::Path as StoragePath;
use object_store::{MultipartUpload, ObjectStore};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StorageConfig, StorageProvider};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata returned after upload
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub key: String,
    pub etag: Option<String>,
    pub size: usize,
}

/// Storage client wrapping object_store
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl StorageClient {
    /// Create new storage client with any object_store backend
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            bucket: "exportbox-local".to_string(),
        }
    }

    /// Build a client from configuration (S3 or in-process memory backend).
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.provider {
            StorageProvider::Memory => Ok(Self {
                store: Arc::new(object_store::memory::InMemory::new()),
                bucket: config.bucket.clone(),
            }),
            StorageProvider::S3 => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(&config.bucket);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                if let Some(access_key) = &config.access_key {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = &config.secret_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                let store = builder
                    .build()
                    .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
                Ok(Self {
                    store: Arc::new(store),
                    bucket: config.bucket.clone(),
                })
            }
        }
    }

    /// Upload bytes to storage
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<UploadMetadata> {
        let path = StoragePath::from(key);
        let size = data.len();

        let put_result = self.store.put(&path, data.into()).await?;

        tracing::debug!(key, size, "Uploaded to storage");

        Ok(UploadMetadata {
            key: key.to_string(),
            etag: put_result.e_tag.clone(),
            size,
        })
    }

    /// Start a multipart upload; the caller streams parts and either
    /// completes or aborts the handle. Aborting discards already-written
    /// parts so partial objects are never visible under the key.
    pub async fn put_multipart(&self, key: &str) -> Result<Box<dyn MultipartUpload>> {
        let path = StoragePath::from(key);
        let upload = self.store.put_multipart(&path).await?;
        Ok(upload)
    }

    /// Download from storage
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = StoragePath::from(key);
        let result = self.store.get(&path).await?;
        let bytes = result.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Check if key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a single object (administrative cleanup).
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = StoragePath::from(key);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
