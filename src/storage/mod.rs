// ABOUTME: Blob storage contract - put/get/copy/delete of bytes by bucket and key
// ABOUTME: Backs snapshot slots, dated backups and the error sink

pub mod fs;
pub mod snapshot;

use async_trait::async_trait;
use thiserror::Error;

pub use fs::FsBlobStore;
pub use snapshot::{SnapshotStore, Slot};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no object at {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("object already exists at {bucket}/{key}")]
    AlreadyExists { bucket: String, key: String },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("storage i/o error on {bucket}/{key}: {source}")]
    Io {
        bucket: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Store only when no object exists at the key yet.
    async fn put_if_absent(&self, bucket: &str, key: &str, bytes: &[u8]) -> StorageResult<()>;

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>>;

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>>;
}
