use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use super::{
    check_weights, memory::WeightSubmission, RegistryClient, RegistryError, RegistrySnapshot,
    SnapshotView,
};

/// Registry backed by a JSON snapshot file, re-read on every sync.
/// Submissions are appended to a JSON-lines ledger.
#[derive(Debug)]
pub struct FileRegistry {
    snapshot_path: PathBuf,
    ledger_path: PathBuf,
    view: SnapshotView,
}

impl FileRegistry {
    /// Uses `<snapshot>.weights.jsonl` as the ledger.
    #[must_use]
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let mut ledger = snapshot_path.clone().into_os_string();
        ledger.push(".weights.jsonl");
        Self {
            snapshot_path,
            ledger_path: PathBuf::from(ledger),
            view: SnapshotView::default(),
        }
    }

    /// Overrides the ledger location.
    #[must_use]
    pub fn with_ledger(mut self, ledger_path: impl Into<PathBuf>) -> Self {
        self.ledger_path = ledger_path.into();
        self
    }

    /// Ledger receiving submissions.
    #[must_use]
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }
}

#[async_trait]
impl RegistryClient for FileRegistry {
    fn latest(&self) -> Option<Arc<RegistrySnapshot>> {
        self.view.get()
    }

    async fn sync_snapshot(&self, lite: bool) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let raw = fs::read(&self.snapshot_path).await.map_err(|err| {
            RegistryError::Network(format!("reading {}: {err}", self.snapshot_path.display()))
        })?;
        let snapshot: RegistrySnapshot = serde_json::from_slice(&raw)
            .map_err(|err| RegistryError::Malformed(err.to_string()))?;
        debug!(
            block = snapshot.block,
            neurons = snapshot.len(),
            lite,
            "synced registry snapshot from file"
        );
        self.view.install(snapshot)
    }

    async fn submit_weights(&self, uids: &[u16], weights: &[f32]) -> Result<(), RegistryError> {
        check_weights(uids, weights)?;
        let record = WeightSubmission {
            block: self.view.get().map_or(0, |snapshot| snapshot.block),
            uids: uids.to_vec(),
            weights: weights.to_vec(),
        };
        let mut line =
            serde_json::to_vec(&record).map_err(|err| RegistryError::Rejected(err.to_string()))?;
        line.push(b'\n');
        let transport = |err: std::io::Error| {
            RegistryError::Network(format!("writing {}: {err}", self.ledger_path.display()))
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .await
            .map_err(transport)?;
        file.write_all(&line).await.map_err(transport)?;
        file.flush().await.map_err(transport)?;
        Ok(())
    }
}
