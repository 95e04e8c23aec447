use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use super::{ConfigStore, StoreError};

/// Serves `<root>/<bucket>/<key>` from disk.
#[derive(Debug, Clone)]
pub struct LocalConfigStore {
    root: PathBuf,
}

impl LocalConfigStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ConfigStore for LocalConfigStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.root.join(bucket).join(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(bucket, key))
            }
            Err(err) => Err(StoreError::Transport(format!("{}: {err}", path.display()))),
        }
    }
}
