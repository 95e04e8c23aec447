//! Registry (metagraph) capability consumed by the lifecycle manager.
//!
//! The wire protocol lives behind [`RegistryClient`]; this module only fixes the
//! shape of snapshots and the three operations the node needs.

/// File-backed registry for local networks.
pub mod file;
/// Scriptable in-memory registry.
pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by registry calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Transport failure; retry on the next tick.
    #[error("registry network error: {0}")]
    Network(String),
    /// The registry refused the request.
    #[error("registry rejected request: {0}")]
    Rejected(String),
    /// The registry answered with data that does not hold together.
    #[error("malformed registry snapshot: {0}")]
    Malformed(String),
}

/// Point-in-time view of every registered neuron.
///
/// All metric vectors are indexed by position in `hotkeys` / `uids`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistrySnapshot {
    /// Block height the snapshot was taken at.
    pub block: u64,
    /// Registry uids.
    pub uids: Vec<u16>,
    /// Registered hotkeys.
    pub hotkeys: Vec<String>,
    /// Stake per neuron.
    #[serde(default)]
    pub stake: Vec<f64>,
    /// Rank per neuron.
    #[serde(default)]
    pub rank: Vec<f64>,
    /// Trust per neuron.
    #[serde(default)]
    pub trust: Vec<f64>,
    /// Consensus per neuron.
    #[serde(default)]
    pub consensus: Vec<f64>,
    /// Incentive per neuron.
    #[serde(default)]
    pub incentive: Vec<f64>,
    /// Emission per neuron.
    #[serde(default)]
    pub emission: Vec<f64>,
}

/// Metrics of a single neuron.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NeuronMetrics {
    /// Uid at the index.
    pub uid: u16,
    /// Stake.
    pub stake: f64,
    /// Rank.
    pub rank: f64,
    /// Trust.
    pub trust: f64,
    /// Consensus.
    pub consensus: f64,
    /// Incentive.
    pub incentive: f64,
    /// Emission.
    pub emission: f64,
}

impl NeuronMetrics {
    /// Incentive scaled for display.
    #[must_use]
    pub fn scaled_incentive(&self) -> f64 {
        self.incentive * 100_000.0
    }

    /// Trust as a percentage.
    #[must_use]
    pub fn scaled_trust(&self) -> f64 {
        self.trust * 100.0
    }

    /// Consensus scaled for display.
    #[must_use]
    pub fn scaled_consensus(&self) -> f64 {
        self.consensus * 100_000.0
    }
}

impl RegistrySnapshot {
    /// Number of registered neurons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uids.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Position of `hotkey`, if registered.
    #[must_use]
    pub fn lookup_index(&self, hotkey: &str) -> Option<usize> {
        self.hotkeys.iter().position(|candidate| candidate == hotkey)
    }

    /// Whether `hotkey` is registered.
    #[must_use]
    pub fn contains(&self, hotkey: &str) -> bool {
        self.lookup_index(hotkey).is_some()
    }

    /// Metrics at `index`; missing metric entries read as zero.
    #[must_use]
    pub fn metrics_at(&self, index: usize) -> Option<NeuronMetrics> {
        let uid = *self.uids.get(index)?;
        let at = |values: &[f64]| values.get(index).copied().unwrap_or(0.0);
        Some(NeuronMetrics {
            uid,
            stake: at(&self.stake),
            rank: at(&self.rank),
            trust: at(&self.trust),
            consensus: at(&self.consensus),
            incentive: at(&self.incentive),
            emission: at(&self.emission),
        })
    }

    /// Checks that identities and uids line up.
    ///
    /// # Errors
    /// Returns [`RegistryError::Malformed`] when the vectors disagree in length.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.uids.len() != self.hotkeys.len() {
            return Err(RegistryError::Malformed(format!(
                "{} uids but {} hotkeys",
                self.uids.len(),
                self.hotkeys.len()
            )));
        }
        Ok(())
    }
}

/// Registry operations the node depends on.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// The most recently synced snapshot, if any sync has succeeded.
    fn latest(&self) -> Option<Arc<RegistrySnapshot>>;

    /// Position of `hotkey` in the latest synced snapshot.
    fn lookup_index(&self, hotkey: &str) -> Option<usize> {
        self.latest()
            .and_then(|snapshot| snapshot.lookup_index(hotkey))
    }

    /// Pulls a fresh snapshot and makes it the latest view.
    async fn sync_snapshot(&self, lite: bool) -> Result<Arc<RegistrySnapshot>, RegistryError>;

    /// Submits a weight vector; `uids` and `weights` have equal length.
    async fn submit_weights(&self, uids: &[u16], weights: &[f32]) -> Result<(), RegistryError>;
}

/// Latest-snapshot holder shared by registry implementations.
#[derive(Default)]
pub struct SnapshotView {
    latest: RwLock<Option<Arc<RegistrySnapshot>>>,
}

impl fmt::Debug for SnapshotView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotView")
            .field(
                "block",
                &self.latest.read().as_ref().map(|snapshot| snapshot.block),
            )
            .finish()
    }
}

impl SnapshotView {
    /// Current snapshot.
    #[must_use]
    pub fn get(&self) -> Option<Arc<RegistrySnapshot>> {
        self.latest.read().clone()
    }

    /// Validates and installs a snapshot.
    ///
    /// # Errors
    /// Returns [`RegistryError::Malformed`] and keeps the previous view.
    pub fn install(&self, snapshot: RegistrySnapshot) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        snapshot.validate()?;
        let snapshot = Arc::new(snapshot);
        *self.latest.write() = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

pub(crate) fn check_weights(uids: &[u16], weights: &[f32]) -> Result<(), RegistryError> {
    if uids.len() != weights.len() {
        return Err(RegistryError::Rejected(format!(
            "{} uids but {} weights",
            uids.len(),
            weights.len()
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(RegistryError::Rejected(
            "weights must be finite and non-negative".into(),
        ));
    }
    Ok(())
}
