use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ConfigStore, StoreError};

/// Map-backed store; a store marked offline fails every fetch.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    offline: RwLock<bool>,
}

impl InMemoryConfigStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object.
    pub fn put(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Removes an object.
    pub fn remove(&self, bucket: &str, key: &str) {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
    }

    /// Toggles transport failures.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.write() = offline;
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        if *self.offline.read() {
            return Err(StoreError::Transport("store offline".into()));
        }
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }
}
