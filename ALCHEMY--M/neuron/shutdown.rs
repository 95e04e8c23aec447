//! Cooperative and emergency shutdown shared by both actors.
//!
//! A single watch channel carries the first shutdown reason. Both loops select on
//! [`ShutdownCoordinator::cancelled`] at their sleep points. An emergency shutdown
//! additionally arms a grace timer after which the [`Terminator`] runs, at most once
//! per process.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit code of the deregistration hard stop.
pub const EXIT_DEREGISTERED: i32 = 3;

/// Why the node is stopping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    /// The operator interrupted the process.
    OperatorInterrupt,
    /// The registry no longer lists this node.
    Deregistered,
}

impl ShutdownReason {
    /// Process exit code for the reason.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::OperatorInterrupt => 0,
            Self::Deregistered => EXIT_DEREGISTERED,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorInterrupt => write!(f, "operator interrupt"),
            Self::Deregistered => write!(f, "deregistration"),
        }
    }
}

/// Ends the process after an emergency shutdown.
pub trait Terminator: Send + Sync {
    /// Stops the process. Production implementations do not return.
    fn terminate(&self, reason: ShutdownReason);
}

/// Exits the process immediately, skipping destructors and pending tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, reason: ShutdownReason) {
        error!(%reason, code = reason.exit_code(), "terminating process");
        std::process::exit(reason.exit_code());
    }
}

struct Inner {
    signal: watch::Sender<Option<ShutdownReason>>,
    terminated: AtomicBool,
    terminator: Arc<dyn Terminator>,
    grace: Duration,
}

/// Shared shutdown handle; clones observe the same signal.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("reason", &self.reason())
            .field("terminated", &self.is_terminated())
            .field("grace", &self.inner.grace)
            .finish()
    }
}

impl ShutdownCoordinator {
    /// Creates a coordinator that calls `terminator` after `grace` on emergencies.
    #[must_use]
    pub fn new(terminator: Arc<dyn Terminator>, grace: Duration) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                signal,
                terminated: AtomicBool::new(false),
                terminator,
                grace,
            }),
        }
    }

    /// Records `reason` as the shutdown cause. Returns `false` if a shutdown was
    /// already in progress; the first reason wins.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.inner.signal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            info!(%reason, "shutdown requested");
        }
        first
    }

    /// Reason of the pending shutdown, if any.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.signal.borrow()
    }

    /// Whether a shutdown was requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once a shutdown is requested (immediately if one already was).
    pub async fn cancelled(&self) -> ShutdownReason {
        let mut receiver = self.inner.signal.subscribe();
        loop {
            let current = *receiver.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if receiver.changed().await.is_err() {
                // sender lives in `inner`, which outlives every receiver
                std::future::pending::<()>().await;
            }
        }
    }

    /// Signals both actors, waits the grace period, then terminates. Does nothing
    /// when a shutdown for another reason is already under way.
    pub async fn emergency(&self, reason: ShutdownReason) {
        if !self.trigger(reason) && self.reason() != Some(reason) {
            info!(
                requested = %reason,
                current = ?self.reason(),
                "shutdown already in progress; skipping emergency termination"
            );
            return;
        }
        warn!(
            %reason,
            grace_secs = self.inner.grace.as_secs_f64(),
            "emergency shutdown; terminating after grace period"
        );
        tokio::time::sleep(self.inner.grace).await;
        self.terminate_now(reason);
    }

    /// Invokes the terminator unless it already ran. Returns whether it ran now.
    pub fn terminate_now(&self, reason: ShutdownReason) -> bool {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.terminator.terminate(reason);
        true
    }

    /// Whether the terminator has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Configured grace period.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.inner.grace
    }
}

/// Terminator that only counts calls.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CountingTerminator {
    pub(crate) calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Terminator for CountingTerminator {
    fn terminate(&self, _reason: ShutdownReason) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(grace: Duration) -> (ShutdownCoordinator, Arc<CountingTerminator>) {
        let terminator = Arc::new(CountingTerminator::default());
        (ShutdownCoordinator::new(terminator.clone(), grace), terminator)
    }

    #[tokio::test]
    async fn first_reason_wins() {
        let (shutdown, _) = coordinator(Duration::ZERO);
        assert!(shutdown.trigger(ShutdownReason::OperatorInterrupt));
        assert!(!shutdown.trigger(ShutdownReason::Deregistered));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::OperatorInterrupt));
        assert_eq!(shutdown.cancelled().await, ShutdownReason::OperatorInterrupt);
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let (shutdown, _) = coordinator(Duration::ZERO);
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        tokio::task::yield_now().await;
        shutdown.trigger(ShutdownReason::Deregistered);
        assert_eq!(waiter.await.unwrap(), ShutdownReason::Deregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_terminates_once_after_grace() {
        let (shutdown, terminator) = coordinator(Duration::from_secs(10));
        let emergency = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.emergency(ShutdownReason::Deregistered).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(shutdown.is_triggered());
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 0);
        emergency.await.unwrap();
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);

        shutdown.emergency(ShutdownReason::Deregistered).await;
        assert!(!shutdown.terminate_now(ShutdownReason::Deregistered));
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_defers_to_interrupt_in_progress() {
        let (shutdown, terminator) = coordinator(Duration::from_secs(10));
        shutdown.trigger(ShutdownReason::OperatorInterrupt);
        shutdown.emergency(ShutdownReason::Deregistered).await;
        assert_eq!(shutdown.reason(), Some(ShutdownReason::OperatorInterrupt));
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 0);
        assert!(!shutdown.is_terminated());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ShutdownReason::OperatorInterrupt.exit_code(), 0);
        assert_eq!(ShutdownReason::Deregistered.exit_code(), EXIT_DEREGISTERED);
    }
}
