use std::fmt;

use serde::Serialize;

use super::LifecycleError;
use crate::registry::{NeuronMetrics, RegistrySnapshot};

/// One-hot weight vector of length `n` with `1.0` at `index`.
///
/// # Errors
/// Returns [`LifecycleError::IndexOutOfRange`] when `index >= n`.
pub fn self_weight_vector(n: usize, index: usize) -> Result<Vec<f32>, LifecycleError> {
    if index >= n {
        return Err(LifecycleError::IndexOutOfRange { index, len: n });
    }
    let mut weights = vec![0.0; n];
    weights[index] = 1.0;
    Ok(weights)
}

/// Periodic status line for the registered node.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct TelemetryLine {
    /// Lifecycle step the line was produced on.
    pub step: u64,
    /// Snapshot block.
    pub block: u64,
    /// Metrics at the node's index.
    pub metrics: NeuronMetrics,
}

impl TelemetryLine {
    /// Line for `index` in `snapshot`, or `None` if the index is not present.
    #[must_use]
    pub fn from_snapshot(step: u64, snapshot: &RegistrySnapshot, index: usize) -> Option<Self> {
        Some(Self {
            step,
            block: snapshot.block,
            metrics: snapshot.metrics_at(index)?,
        })
    }
}

impl fmt::Display for TelemetryLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metrics;
        write!(
            f,
            "Step:{} | Block:{} | Stake:{:.4} | Rank:{:.4} | Trust:{:.4} | Consensus:{:.6} | Incentive:{:.6} | Emission:{:.6}",
            self.step, self.block, m.stake, m.rank, m.trust, m.consensus, m.incentive, m.emission
        )
    }
}
