//! Background worker: membership watchdog, policy refresh and artifact cleanup.
//!
//! The worker fires immediately and then every `interval`. Sub-tasks are gated by
//! a [`BackgroundSchedule`] over a 0-based tick counter and fail independently;
//! only a confirmed deregistration is fatal. Cleanup sweeps run detached so slow
//! external commands never delay the next membership check.

/// Experiment artifact cleanup.
pub mod cleanup;

use std::{sync::Arc, time::Duration};

use cleanup::{ArtifactJanitor, CleanupOutcome};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    options::{Identity, TimingOptions},
    policy::{ConfigCache, PolicyLoader},
    registry::RegistryClient,
    shutdown::{ShutdownCoordinator, ShutdownReason},
    state::NodeState,
    telemetry::NeuronTelemetry,
};

/// When a sub-task runs, in worker ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSchedule {
    /// Run on ticks divisible by this.
    pub every: u64,
    /// Skip the very first tick.
    pub skip_first: bool,
}

impl TaskSchedule {
    /// Every tick, including the first.
    pub const EVERY_TICK: Self = Self {
        every: 1,
        skip_first: false,
    };

    /// Whether the task runs on 0-based tick `step`.
    #[must_use]
    pub const fn is_due(&self, step: u64) -> bool {
        if self.skip_first && step == 0 {
            return false;
        }
        self.every != 0 && step % self.every == 0
    }
}

/// Schedule table of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundSchedule {
    /// Base interval between ticks.
    pub interval: Duration,
    /// Registry membership check.
    pub deregistration: TaskSchedule,
    /// Policy refresh.
    pub config_refresh: TaskSchedule,
    /// Artifact cleanup.
    pub cleanup: TaskSchedule,
}

impl Default for BackgroundSchedule {
    fn default() -> Self {
        Self::from_timing(&TimingOptions::default())
    }
}

impl BackgroundSchedule {
    /// Schedule from timing options.
    #[must_use]
    pub fn from_timing(timing: &TimingOptions) -> Self {
        Self {
            interval: Duration::from_secs(timing.background_secs),
            deregistration: TaskSchedule {
                every: 1,
                skip_first: true,
            },
            config_refresh: TaskSchedule::EVERY_TICK,
            cleanup: TaskSchedule {
                every: timing.cleanup_every.max(1),
                skip_first: false,
            },
        }
    }
}

/// Result of a membership check.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum MembershipCheck {
    /// Still registered.
    Registered {
        /// Current index.
        index: usize,
    },
    /// The fresh snapshot no longer lists the identity.
    Deregistered,
    /// The snapshot could not be synced.
    Failed(String),
}

/// Result of a policy refresh.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum PolicyRefresh {
    /// A new generation was installed.
    Replaced {
        /// Installed generation.
        generation: u64,
    },
    /// The refresh failed; the previous generation stays.
    Kept {
        /// Failure description.
        error: String,
    },
}

/// Cleanup sub-task result; the sweep itself finishes in the background.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum CleanupDispatch {
    /// A sweep was started.
    Started,
    /// The previous sweep is still running; none was started.
    StillRunning,
}

/// What one tick did; `None` marks a sub-task that was not due.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkerTickReport {
    /// 0-based tick number.
    pub step: u64,
    /// Membership check result.
    pub membership: Option<MembershipCheck>,
    /// Policy refresh result.
    pub policy: Option<PolicyRefresh>,
    /// Cleanup dispatch.
    pub cleanup: Option<CleanupDispatch>,
}

impl WorkerTickReport {
    /// Whether the tick confirmed a deregistration.
    #[must_use]
    pub fn deregistered(&self) -> bool {
        self.membership == Some(MembershipCheck::Deregistered)
    }
}

/// Periodic policy sync and membership watchdog.
pub struct BackgroundSyncWorker {
    identity: Identity,
    registry: Arc<dyn RegistryClient>,
    loader: PolicyLoader,
    cache: ConfigCache,
    state: NodeState,
    shutdown: ShutdownCoordinator,
    janitor: Option<Arc<ArtifactJanitor>>,
    cleanup_task: Option<JoinHandle<CleanupOutcome>>,
    schedule: BackgroundSchedule,
    telemetry: Option<NeuronTelemetry>,
    step: u64,
}

impl std::fmt::Debug for BackgroundSyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSyncWorker")
            .field("hotkey", &self.identity.hotkey)
            .field("loader", &self.loader)
            .field("janitor", &self.janitor)
            .field("cleanup_running", &self.cleanup_running())
            .field("schedule", &self.schedule)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl BackgroundSyncWorker {
    /// Worker with the default schedule and no cleanup.
    #[must_use]
    pub fn new(
        identity: Identity,
        registry: Arc<dyn RegistryClient>,
        loader: PolicyLoader,
        cache: ConfigCache,
        state: NodeState,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            identity,
            registry,
            loader,
            cache,
            state,
            shutdown,
            janitor: None,
            cleanup_task: None,
            schedule: BackgroundSchedule::default(),
            telemetry: None,
            step: 0,
        }
    }

    /// Enables artifact cleanup.
    #[must_use]
    pub fn with_janitor(mut self, janitor: ArtifactJanitor) -> Self {
        self.janitor = Some(Arc::new(janitor));
        self
    }

    /// Replaces the schedule table.
    #[must_use]
    pub const fn with_schedule(mut self, schedule: BackgroundSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<NeuronTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Ticks run so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.step
    }

    /// Whether a cleanup sweep is in flight.
    #[must_use]
    pub fn cleanup_running(&self) -> bool {
        self.cleanup_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Waits for the in-flight cleanup sweep, if any, and returns its outcome.
    pub async fn wait_cleanup(&mut self) -> Option<CleanupOutcome> {
        let task = self.cleanup_task.take()?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(error = %err, "cleanup task aborted");
                None
            }
        }
    }

    /// Runs every due sub-task once, in schedule order.
    pub async fn tick(&mut self) -> WorkerTickReport {
        let step = self.step;
        self.step += 1;
        let mut report = WorkerTickReport {
            step,
            membership: None,
            policy: None,
            cleanup: None,
        };

        if self.schedule.deregistration.is_due(step) {
            let check = self.check_membership().await;
            report.membership = Some(check);
            if report.deregistered() {
                return report;
            }
        }
        if self.schedule.config_refresh.is_due(step) {
            report.policy = Some(self.refresh_policy().await);
        }
        if self.schedule.cleanup.is_due(step) {
            report.cleanup = self.dispatch_cleanup();
        }
        report
    }

    fn dispatch_cleanup(&mut self) -> Option<CleanupDispatch> {
        let janitor = Arc::clone(self.janitor.as_ref()?);
        if self.cleanup_running() {
            debug!("previous cleanup sweep still running; skipping");
            return Some(CleanupDispatch::StillRunning);
        }
        let telemetry = self.telemetry.clone();
        self.cleanup_task = Some(tokio::spawn(async move {
            let outcome = janitor.sweep().await;
            debug!(?outcome, "cleanup sweep finished");
            if let Some(telemetry) = telemetry {
                telemetry
                    .record(
                        LogLevel::Debug,
                        "worker.cleanup_finished",
                        json!({ "outcome": outcome }),
                    )
                    .await;
            }
            outcome
        }));
        Some(CleanupDispatch::Started)
    }

    async fn check_membership(&self) -> MembershipCheck {
        match self.registry.sync_snapshot(true).await {
            Ok(snapshot) => {
                let index = snapshot.lookup_index(&self.identity.hotkey);
                self.state.set_registration_index(index);
                match index {
                    Some(index) => MembershipCheck::Registered { index },
                    None => {
                        error!(
                            hotkey = %self.identity.hotkey,
                            block = snapshot.block,
                            "identity deregistered from the registry"
                        );
                        self.emit(
                            LogLevel::Error,
                            "worker.deregistered",
                            json!({ "block": snapshot.block }),
                        )
                        .await;
                        MembershipCheck::Deregistered
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "membership check failed");
                MembershipCheck::Failed(err.to_string())
            }
        }
    }

    async fn refresh_policy(&self) -> PolicyRefresh {
        match self.loader.load().await {
            Ok(snapshot) => {
                let generation = self.cache.replace(snapshot);
                debug!(generation, "policy refreshed");
                self.emit(
                    LogLevel::Debug,
                    "worker.policy_refreshed",
                    json!({ "generation": generation }),
                )
                .await;
                PolicyRefresh::Replaced { generation }
            }
            Err(err) => {
                error!(error = %err, "policy refresh failed; keeping previous policy");
                self.emit(
                    LogLevel::Error,
                    "worker.policy_refresh_failed",
                    json!({ "error": err.to_string() }),
                )
                .await;
                PolicyRefresh::Kept {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Ticks until shutdown. A deregistration starts the emergency shutdown and
    /// returns once the terminator ran.
    pub async fn run(mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = self.shutdown.reason() {
                return reason;
            }
            let report = self.tick().await;
            if report.deregistered() {
                self.shutdown.emergency(ShutdownReason::Deregistered).await;
                return self.shutdown.reason().unwrap_or(ShutdownReason::Deregistered);
            }
            tokio::select! {
                () = tokio::time::sleep(self.schedule.interval) => {}
                reason = self.shutdown.cancelled() => return reason,
            }
        }
    }

    async fn emit(&self, level: LogLevel, event_type: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(level, event_type, payload).await;
        }
    }
}
