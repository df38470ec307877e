//! Result storage.
//!
//! All writes go to deterministic keys, so re-running a job overwrites its
//! previous objects instead of adding new ones.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_types::error::display::DisplayErrorContext;

use crate::lease::LeaseHandle;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Upload of {key} failed: {reason}")]
    Put { key: String, reason: String },

    #[error("Download of {key} failed: {reason}")]
    Get { key: String, reason: String },
}

/// Flat key/value object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write (or overwrite) `key`.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Read `key`. `Ok(None)` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

/// [`BlobStore`] over the lease's bucket.
pub struct S3BlobStore {
    lease: Arc<LeaseHandle>,
}

impl S3BlobStore {
    pub fn new(lease: Arc<LeaseHandle>) -> Self {
        Self { lease }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let lease = self.lease.snapshot().await;
        let size = body.len();

        lease
            .s3()
            .put_object()
            .bucket(lease.bucket())
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Put {
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!(bucket = %lease.bucket(), key, size, "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let lease = self.lease.snapshot().await;

        let output = match lease
            .s3()
            .get_object()
            .bucket(lease.bucket())
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None);
            }
            Err(e) => {
                return Err(StorageError::Get {
                    key: key.to_string(),
                    reason: DisplayErrorContext(&e).to_string(),
                })
            }
        };

        let bytes = output.body.collect().await.map_err(|e| StorageError::Get {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }
}
