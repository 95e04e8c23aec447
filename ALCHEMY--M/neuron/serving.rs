//! Admission control at the node's serving boundary.
//!
//! The transport itself is out of scope; the gate decides whether a caller may be
//! served under the current policy snapshot and accounts for served requests.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{policy::ConfigCache, state::NodeState};

/// Keys presented by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    /// Caller hotkey.
    pub hotkey: String,
    /// Caller coldkey.
    pub coldkey: String,
}

impl Caller {
    /// Builds a caller.
    #[must_use]
    pub fn new(hotkey: impl Into<String>, coldkey: impl Into<String>) -> Self {
        Self {
            hotkey: hotkey.into(),
            coldkey: coldkey.into(),
        }
    }
}

/// Gate decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Admission {
    /// Serve the request.
    Accepted,
    /// The gate is not open.
    Closed,
    /// The caller is denied by policy.
    Blacklisted,
}

/// Serving boundary handle; clones share the open flag.
#[derive(Debug, Clone)]
pub struct ServingGate {
    cache: ConfigCache,
    state: NodeState,
    open: Arc<AtomicBool>,
    port: u16,
}

impl ServingGate {
    /// Closed gate bound to `port`.
    #[must_use]
    pub fn new(cache: ConfigCache, state: NodeState, port: u16) -> Self {
        Self {
            cache,
            state,
            open: Arc::new(AtomicBool::new(false)),
            port,
        }
    }

    /// Port the boundary listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Starts admitting callers.
    pub fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            info!(port = self.port, "serving boundary open");
        }
    }

    /// Stops admitting callers.
    pub fn stop(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!(port = self.port, "serving boundary stopped");
        }
    }

    /// Whether callers are admitted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Decides whether `caller` may be served.
    #[must_use]
    pub fn admit(&self, caller: &Caller) -> Admission {
        if !self.is_open() {
            return Admission::Closed;
        }
        let policy = self.cache.read();
        if policy.is_whitelisted(&caller.hotkey, &caller.coldkey) {
            return Admission::Accepted;
        }
        if policy.is_blacklisted(&caller.hotkey, &caller.coldkey) {
            debug!(hotkey = %caller.hotkey, "rejecting blacklisted caller");
            return Admission::Blacklisted;
        }
        Admission::Accepted
    }

    /// Query deadline from the current policy.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.cache.read().query_timeout
    }

    /// Accounts for a served request.
    pub fn record_completion(&self, generation_time: Duration, nsfw: bool) {
        self.state.record_request(generation_time, nsfw);
    }

    /// Accounts for a request that missed its deadline.
    pub fn record_timeout(&self) {
        self.state.record_timeout();
    }
}
