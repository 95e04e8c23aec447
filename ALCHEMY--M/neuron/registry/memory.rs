use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{check_weights, RegistryClient, RegistryError, RegistrySnapshot, SnapshotView};

/// Weight vector accepted by a registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightSubmission {
    /// Block of the snapshot current at submission time.
    pub block: u64,
    /// Uids, in snapshot order.
    pub uids: Vec<u16>,
    /// Weights, parallel to `uids`.
    pub weights: Vec<f32>,
}

/// Registry double: the next sync returns whatever snapshot was staged last,
/// failures can be injected, and accepted submissions are recorded.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    view: SnapshotView,
    staged: Mutex<RegistrySnapshot>,
    submissions: Mutex<Vec<WeightSubmission>>,
    failing_syncs: AtomicUsize,
    failing_submissions: AtomicUsize,
    syncs: AtomicUsize,
}

impl InMemoryRegistry {
    /// Stages `snapshot` for the next sync; nothing is synced yet.
    #[must_use]
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            staged: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    /// Stages and installs `snapshot` as if one sync already happened.
    ///
    /// # Errors
    /// Returns [`RegistryError::Malformed`] for misaligned snapshots.
    pub fn synced(snapshot: RegistrySnapshot) -> Result<Self, RegistryError> {
        let registry = Self::new(snapshot.clone());
        registry.view.install(snapshot)?;
        Ok(registry)
    }

    /// Replaces the snapshot returned by subsequent syncs.
    pub fn stage(&self, snapshot: RegistrySnapshot) {
        *self.staged.lock() = snapshot;
    }

    /// Makes the next `count` syncs fail with a network error.
    pub fn fail_next_syncs(&self, count: usize) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` submissions fail with a network error.
    pub fn fail_next_submissions(&self, count: usize) {
        self.failing_submissions.store(count, Ordering::SeqCst);
    }

    /// Accepted submissions, oldest first.
    #[must_use]
    pub fn submissions(&self) -> Vec<WeightSubmission> {
        self.submissions.lock().clone()
    }

    /// Number of sync attempts, failed ones included.
    #[must_use]
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    fn latest(&self) -> Option<Arc<RegistrySnapshot>> {
        self.view.get()
    }

    async fn sync_snapshot(&self, _lite: bool) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_syncs) {
            return Err(RegistryError::Network("injected sync failure".into()));
        }
        let staged = self.staged.lock().clone();
        self.view.install(staged)
    }

    async fn submit_weights(&self, uids: &[u16], weights: &[f32]) -> Result<(), RegistryError> {
        check_weights(uids, weights)?;
        if Self::take_failure(&self.failing_submissions) {
            return Err(RegistryError::Network("injected submission failure".into()));
        }
        let block = self.view.get().map_or(0, |snapshot| snapshot.block);
        self.submissions.lock().push(WeightSubmission {
            block,
            uids: uids.to_vec(),
            weights: weights.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(hotkeys: &[&str]) -> RegistrySnapshot {
        RegistrySnapshot {
            block: 7,
            uids: (0..hotkeys.len() as u16).collect(),
            hotkeys: hotkeys.iter().map(|h| (*h).to_string()).collect(),
            ..RegistrySnapshot::default()
        }
    }

    #[tokio::test]
    async fn lookup_uses_latest_sync_only() {
        let registry = InMemoryRegistry::new(snapshot(&["a", "me"]));
        assert_eq!(registry.lookup_index("me"), None);
        registry.sync_snapshot(true).await.unwrap();
        assert_eq!(registry.lookup_index("me"), Some(1));
        registry.stage(snapshot(&["a"]));
        assert_eq!(registry.lookup_index("me"), Some(1));
        registry.sync_snapshot(true).await.unwrap();
        assert_eq!(registry.lookup_index("me"), None);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let registry = InMemoryRegistry::new(snapshot(&["a"]));
        registry.fail_next_syncs(1);
        assert!(registry.sync_snapshot(false).await.is_err());
        assert!(registry.sync_snapshot(false).await.is_ok());
        assert_eq!(registry.sync_count(), 2);

        registry.fail_next_submissions(1);
        assert!(registry.submit_weights(&[0], &[1.0]).await.is_err());
        registry.submit_weights(&[0], &[1.0]).await.unwrap();
        assert_eq!(registry.submissions().len(), 1);
        assert_eq!(registry.submissions()[0].block, 7);
    }
}
