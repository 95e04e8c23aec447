//! Shared node state: the registration index and cumulative request statistics.
//!
//! Both actors hold a clone of [`NodeState`]; clones share the same storage.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Cumulative counters for the process lifetime. Never reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStats {
    /// When the node started.
    pub start_time: DateTime<Utc>,
    /// Start time formatted as `%Y/%m/%d %H:%M` (local time).
    pub start_dt: String,
    /// Requests admitted at the serving boundary.
    pub total_requests: u64,
    /// Requests that exceeded the query timeout.
    pub timeouts: u64,
    /// Outputs flagged by the safety checker.
    pub nsfw_count: u64,
    /// Total generation time in milliseconds.
    pub generation_time_ms: u64,
}

impl NodeStats {
    /// Fresh counters stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            start_dt: now.with_timezone(&Local).format("%Y/%m/%d %H:%M").to_string(),
            total_requests: 0,
            timeouts: 0,
            nsfw_count: 0,
            generation_time_ms: 0,
        }
    }

    /// Mean generation time per admitted request.
    #[must_use]
    pub fn average_generation_ms(&self) -> u64 {
        self.generation_time_ms
            .checked_div(self.total_requests)
            .unwrap_or(0)
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the node's registration index and statistics.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    registration_index: Arc<RwLock<Option<usize>>>,
    stats: Arc<Mutex<NodeStats>>,
}

impl NodeState {
    /// Unregistered state with fresh statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of this node in the latest snapshot, if registered.
    #[must_use]
    pub fn registration_index(&self) -> Option<usize> {
        *self.registration_index.read()
    }

    /// Whether the latest check found the node registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration_index().is_some()
    }

    /// Stores a freshly computed index, returning the previous one.
    pub fn set_registration_index(&self, index: Option<usize>) -> Option<usize> {
        std::mem::replace(&mut *self.registration_index.write(), index)
    }

    /// Copy of the current statistics.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.stats.lock().clone()
    }

    /// Records a completed request.
    pub fn record_request(&self, generation_time: Duration, nsfw: bool) {
        let mut stats = self.stats.lock();
        stats.total_requests += 1;
        stats.generation_time_ms = stats
            .generation_time_ms
            .saturating_add(u64::try_from(generation_time.as_millis()).unwrap_or(u64::MAX));
        if nsfw {
            stats.nsfw_count += 1;
        }
    }

    /// Records a request that ran past its deadline.
    pub fn record_timeout(&self) {
        let mut stats = self.stats.lock();
        stats.total_requests += 1;
        stats.timeouts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_registration_index() {
        let state = NodeState::new();
        let worker_view = state.clone();
        assert!(!state.is_registered());
        assert_eq!(worker_view.set_registration_index(Some(4)), None);
        assert_eq!(state.registration_index(), Some(4));
        assert_eq!(state.set_registration_index(None), Some(4));
        assert!(!worker_view.is_registered());
    }

    #[test]
    fn stats_accumulate() {
        let state = NodeState::new();
        state.record_request(Duration::from_millis(1_500), false);
        state.record_request(Duration::from_millis(500), true);
        state.record_timeout();
        let stats = state.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.nsfw_count, 1);
        assert_eq!(stats.generation_time_ms, 2_000);
        assert_eq!(stats.average_generation_ms(), 666);
        assert_eq!(stats.start_dt.len(), "2025/01/01 00:00".len());
    }

    #[test]
    fn generation_time_saturates() {
        let state = NodeState::new();
        state.record_request(Duration::MAX, false);
        state.record_request(Duration::from_secs(1), false);
        let stats = state.stats();
        assert_eq!(stats.generation_time_ms, u64::MAX);
        assert_eq!(stats.total_requests, 2);
    }
}
