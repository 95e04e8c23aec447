//! Object-store capability used to fetch policy blobs.

/// Anonymous public-bucket HTTP store.
pub mod gcs;
/// Directory-backed store.
pub mod local;
/// Map-backed store.
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by store fetches.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("object {bucket}/{key} not found")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// Transport or service failure.
    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub(crate) fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

/// Fetches named blobs.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Downloads `bucket/key`.
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
}
