//! Durable object storage used by the delivery sink.
//!
//! The sink only ever writes. [`MemoryObjectStore`] additionally exposes
//! what was written so tests and local runs can inspect the destinations.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object storage operation failed: {0}")]
    OperationFailed(String),
    #[error("destination {0} is not reachable")]
    Unreachable(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key` in `bucket`. Writing the same key twice replaces the object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> Result<(), StorageError>;
}

/// S3 backed object store.
pub struct S3ObjectStore {
    client: AwsS3SdkClient,
}

impl S3ObjectStore {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS configuration. A custom endpoint implies path style addressing.
    pub async fn from_env(endpoint: Option<String>) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(endpoint) = endpoint.clone() {
            info!("using custom object storage endpoint {}", endpoint);
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let mut config = Builder::from(&config_loader.load().await);
        if endpoint.is_some() {
            config = config.force_path_style(true);
        }

        Self::new(AwsS3SdkClient::from_conf(config.build()))
    }

    /// Check that a bucket exists and that we may write to it.
    pub async fn check_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|_| StorageError::Unreachable(bucket.to_owned()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_encoding(content_encoding.map(str::to_owned))
            .send()
            .await
            .map_err(|e| StorageError::OperationFailed(format!("failed to put {bucket}/{key}: {e}")))?;

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
}

/// In-memory object store. Clones share the same objects.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<(String, String), StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Keys in `bucket` starting with `prefix`, in lexicographic order.
    pub fn keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| StorageError::OperationFailed("poisoned MemoryObjectStore mutex".to_owned()))?;

        objects.insert(
            (bucket.to_owned(), key.to_owned()),
            StoredObject {
                body,
                content_encoding: content_encoding.map(str::to_owned),
            },
        );

        Ok(())
    }
}
