//! Main registration and weight-submission loop.
//!
//! Every iteration resyncs the registry snapshot, recomputes the node's index and,
//! while registered, reports metrics and asserts the self-weight vector every
//! `report_every` steps. The delay before the next iteration depends only on the
//! [`TickOutcome`] and the [`LoopCadence`].

/// Self-weight vector and status line.
pub mod weights;

use std::{sync::Arc, time::Duration};

use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    options::{Identity, TimingOptions},
    registry::{RegistryClient, RegistryError, RegistrySnapshot},
    serving::ServingGate,
    shutdown::{ShutdownCoordinator, ShutdownReason},
    state::NodeState,
    telemetry::NeuronTelemetry,
};
use weights::{self_weight_vector, TelemetryLine};

/// Non-fatal failures of a single iteration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Registry sync or submission failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The own index does not fit the snapshot.
    #[error("index {index} out of range for {len} neurons")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Snapshot size.
        len: usize,
    },
    /// The loop already terminated.
    #[error("lifecycle loop terminated")]
    Terminated,
}

/// Registration state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Identity absent from the latest snapshot.
    Unregistered,
    /// Identity present at `index`.
    Registered {
        /// Position in the snapshot.
        index: usize,
    },
    /// Loop exited; terminal.
    Terminated,
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not registered; back off.
    Unregistered,
    /// Registered, nothing reported this step.
    Registered {
        /// Position in the snapshot.
        index: usize,
    },
    /// Registered; status reported and self-weight submitted.
    Reported {
        /// Position in the snapshot.
        index: usize,
        /// Step the report was made on.
        step: u64,
    },
    /// Iteration failed; state unchanged.
    Failed(LifecycleError),
}

/// Delays between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCadence {
    /// Registered tick.
    pub tick: Duration,
    /// Delay appended after every iteration.
    pub trailing: Duration,
    /// Unregistered back-off.
    pub backoff: Duration,
    /// Report every N registered steps.
    pub report_every: u64,
}

impl Default for LoopCadence {
    fn default() -> Self {
        Self::from_timing(&TimingOptions::default())
    }
}

impl LoopCadence {
    /// Cadence from timing options.
    #[must_use]
    pub fn from_timing(timing: &TimingOptions) -> Self {
        Self {
            tick: Duration::from_secs(timing.tick_secs),
            trailing: Duration::from_secs(timing.trailing_secs),
            backoff: Duration::from_secs(timing.unregistered_backoff_secs),
            report_every: timing.report_every.max(1),
        }
    }

    /// Delay to wait after `outcome`.
    #[must_use]
    pub fn delay_after(&self, outcome: &TickOutcome) -> Duration {
        match outcome {
            TickOutcome::Unregistered => self.backoff + self.trailing,
            _ => self.tick + self.trailing,
        }
    }

    /// Whether `step` carries a report.
    #[must_use]
    pub const fn reports_on(&self, step: u64) -> bool {
        step % self.report_every == 0
    }
}

/// Registration tracking and self-weight submission.
pub struct LifecycleLoop {
    identity: Identity,
    registry: Arc<dyn RegistryClient>,
    state: NodeState,
    gate: ServingGate,
    shutdown: ShutdownCoordinator,
    cadence: LoopCadence,
    telemetry: Option<NeuronTelemetry>,
    registration: RegistrationState,
    step: u64,
}

impl std::fmt::Debug for LifecycleLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleLoop")
            .field("hotkey", &self.identity.hotkey)
            .field("registration", &self.registration)
            .field("step", &self.step)
            .field("cadence", &self.cadence)
            .finish_non_exhaustive()
    }
}

impl LifecycleLoop {
    /// Creates an unregistered loop.
    #[must_use]
    pub fn new(
        identity: Identity,
        registry: Arc<dyn RegistryClient>,
        state: NodeState,
        gate: ServingGate,
        shutdown: ShutdownCoordinator,
        cadence: LoopCadence,
    ) -> Self {
        Self {
            identity,
            registry,
            state,
            gate,
            shutdown,
            cadence,
            telemetry: None,
            registration: RegistrationState::Unregistered,
            step: 0,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<NeuronTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Current registration state.
    #[must_use]
    pub const fn registration(&self) -> RegistrationState {
        self.registration
    }

    /// Registered steps completed so far.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.step
    }

    /// Declared cadence.
    #[must_use]
    pub const fn cadence(&self) -> &LoopCadence {
        &self.cadence
    }

    /// Resyncs the snapshot and recomputes the registration index.
    ///
    /// # Errors
    /// Returns the registry error; the previous state is kept.
    pub async fn check_registration(&mut self) -> Result<Option<usize>, LifecycleError> {
        self.sync_registration().await.map(|(_, index)| index)
    }

    /// Syncs and returns the snapshot the index was computed against.
    async fn sync_registration(
        &mut self,
    ) -> Result<(Arc<RegistrySnapshot>, Option<usize>), LifecycleError> {
        if self.registration == RegistrationState::Terminated {
            return Err(LifecycleError::Terminated);
        }
        let snapshot = self.registry.sync_snapshot(true).await?;
        let index = snapshot.lookup_index(&self.identity.hotkey);
        self.state.set_registration_index(index);

        match (self.registration, index) {
            (RegistrationState::Registered { .. }, None) => {
                warn!(hotkey = %self.identity.hotkey, block = snapshot.block, "identity no longer registered");
                self.registration = RegistrationState::Unregistered;
                self.emit(
                    LogLevel::Warn,
                    "lifecycle.unregistered",
                    json!({ "block": snapshot.block }),
                )
                .await;
            }
            (RegistrationState::Unregistered, None) => {
                warn!(
                    hotkey = %self.identity.hotkey,
                    retry_secs = self.cadence.backoff.as_secs(),
                    "identity not registered; run the registry registration command and wait"
                );
            }
            (RegistrationState::Unregistered, Some(index)) => {
                let uid = snapshot.uids.get(index).copied();
                info!(index, ?uid, block = snapshot.block, "identity registered");
                self.emit(
                    LogLevel::Info,
                    "lifecycle.registered",
                    json!({ "index": index, "uid": uid, "block": snapshot.block }),
                )
                .await;
            }
            _ => {}
        }
        if let Some(index) = index {
            self.registration = RegistrationState::Registered { index };
        }
        Ok((snapshot, index))
    }

    /// Runs one iteration.
    pub async fn step(&mut self) -> TickOutcome {
        let (snapshot, index) = match self.sync_registration().await {
            Ok((snapshot, Some(index))) => (snapshot, index),
            Ok((_, None)) => return TickOutcome::Unregistered,
            Err(err) => {
                warn!(error = %err, "lifecycle iteration failed");
                return TickOutcome::Failed(err);
            }
        };

        if !self.cadence.reports_on(self.step) {
            self.step += 1;
            return TickOutcome::Registered { index };
        }
        match self.report(&snapshot, index).await {
            Ok(()) => {
                let step = self.step;
                self.step += 1;
                TickOutcome::Reported { index, step }
            }
            Err(err) => {
                error!(error = %err, step = self.step, "weight submission failed; retrying next tick");
                self.emit(
                    LogLevel::Error,
                    "lifecycle.weights_failed",
                    json!({ "step": self.step, "error": err.to_string() }),
                )
                .await;
                TickOutcome::Failed(err)
            }
        }
    }

    /// Reports against the snapshot `index` was looked up in, never a newer one.
    async fn report(
        &self,
        snapshot: &RegistrySnapshot,
        index: usize,
    ) -> Result<(), LifecycleError> {
        let line = TelemetryLine::from_snapshot(self.step, snapshot, index).ok_or(
            LifecycleError::IndexOutOfRange {
                index,
                len: snapshot.len(),
            },
        )?;
        info!("{line}");
        self.emit(
            LogLevel::Info,
            "lifecycle.status",
            json!({
                "step": line.step,
                "block": line.block,
                "stake": line.metrics.stake,
                "rank": line.metrics.rank,
                "trust": line.metrics.scaled_trust(),
                "consensus": line.metrics.scaled_consensus(),
                "incentive": line.metrics.scaled_incentive(),
                "emission": line.metrics.emission,
            }),
        )
        .await;

        let weights = self_weight_vector(snapshot.len(), index)?;
        self.registry.submit_weights(&snapshot.uids, &weights).await?;
        info!(index, neurons = snapshot.len(), "self-weight submitted");
        self.emit(
            LogLevel::Info,
            "lifecycle.weights_submitted",
            json!({ "step": self.step, "index": index, "block": snapshot.block }),
        )
        .await;
        Ok(())
    }

    /// Polls until the identity is registered.
    ///
    /// # Errors
    /// Returns the shutdown reason if a shutdown arrives first.
    pub async fn wait_until_registered(&mut self) -> Result<usize, ShutdownReason> {
        loop {
            if let Some(reason) = self.shutdown.reason() {
                return Err(reason);
            }
            match self.check_registration().await {
                Ok(Some(index)) => return Ok(index),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "registration check failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(self.cadence.backoff) => {}
                reason = self.shutdown.cancelled() => return Err(reason),
            }
        }
    }

    /// Runs iterations until shutdown; returns why it stopped.
    pub async fn run(&mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = self.shutdown.reason() {
                return self.terminate(reason).await;
            }
            let outcome = self.step().await;
            let delay = self.cadence.delay_after(&outcome);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                reason = self.shutdown.cancelled() => return self.terminate(reason).await,
            }
        }
    }

    async fn terminate(&mut self, reason: ShutdownReason) -> ShutdownReason {
        self.registration = RegistrationState::Terminated;
        self.gate.stop();
        info!(%reason, steps = self.step, "lifecycle loop terminated");
        self.emit(
            LogLevel::Info,
            "lifecycle.terminated",
            json!({ "reason": reason, "steps": self.step }),
        )
        .await;
        reason
    }

    async fn emit(&self, level: LogLevel, event_type: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(level, event_type, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::ConfigCache,
        registry::memory::InMemoryRegistry,
        shutdown::CountingTerminator,
    };
    use shared_event_bus::MemoryEventBus;

    fn snapshot(hotkeys: &[&str]) -> RegistrySnapshot {
        let n = hotkeys.len();
        RegistrySnapshot {
            block: 1_000,
            uids: (0..n as u16).collect(),
            hotkeys: hotkeys.iter().map(|h| (*h).to_string()).collect(),
            stake: vec![10.0; n],
            trust: vec![0.5; n],
            ..RegistrySnapshot::default()
        }
    }

    struct Harness {
        lifecycle: LifecycleLoop,
        registry: Arc<InMemoryRegistry>,
        state: NodeState,
        gate: ServingGate,
        shutdown: ShutdownCoordinator,
    }

    fn harness(hotkeys: &[&str]) -> Harness {
        let registry = Arc::new(InMemoryRegistry::new(snapshot(hotkeys)));
        let state = NodeState::new();
        let gate = ServingGate::new(ConfigCache::new(), state.clone(), 8091);
        let shutdown = ShutdownCoordinator::new(
            Arc::new(CountingTerminator::default()),
            Duration::from_secs(10),
        );
        let lifecycle = LifecycleLoop::new(
            Identity::new("me", "owner"),
            registry.clone(),
            state.clone(),
            gate.clone(),
            shutdown.clone(),
            LoopCadence::default(),
        );
        Harness {
            lifecycle,
            registry,
            state,
            gate,
            shutdown,
        }
    }

    #[tokio::test]
    async fn stays_unregistered_while_absent() {
        let mut h = harness(&["a", "b"]);
        for _ in 0..3 {
            assert_eq!(h.lifecycle.step().await, TickOutcome::Unregistered);
        }
        assert_eq!(h.lifecycle.registration(), RegistrationState::Unregistered);
        assert_eq!(h.state.registration_index(), None);
        assert_eq!(h.registry.sync_count(), 3);
        assert!(h.registry.submissions().is_empty());
    }

    #[tokio::test]
    async fn reports_every_fifth_step_with_one_hot_weights() {
        let mut h = harness(&["a", "me", "c"]);
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(h.lifecycle.step().await);
        }
        assert_eq!(outcomes[0], TickOutcome::Reported { index: 1, step: 0 });
        assert!(outcomes[1..5]
            .iter()
            .all(|o| *o == TickOutcome::Registered { index: 1 }));
        assert_eq!(outcomes[5], TickOutcome::Reported { index: 1, step: 5 });

        let submissions = h.registry.submissions();
        assert_eq!(submissions.len(), 2);
        for submission in submissions {
            assert_eq!(submission.uids, vec![0, 1, 2]);
            assert_eq!(submission.weights, vec![0.0, 1.0, 0.0]);
        }
        assert_eq!(h.state.registration_index(), Some(1));
    }

    #[tokio::test]
    async fn failed_submission_is_retried_on_same_step() {
        let mut h = harness(&["me"]);
        h.registry.fail_next_submissions(1);
        assert!(matches!(
            h.lifecycle.step().await,
            TickOutcome::Failed(LifecycleError::Registry(RegistryError::Network(_)))
        ));
        assert_eq!(h.lifecycle.step_count(), 0);
        assert_eq!(
            h.lifecycle.step().await,
            TickOutcome::Reported { index: 0, step: 0 }
        );
        assert_eq!(h.registry.submissions().len(), 1);
    }

    #[tokio::test]
    async fn sync_failure_keeps_state() {
        let mut h = harness(&["me"]);
        h.lifecycle.step().await;
        h.registry.fail_next_syncs(1);
        let outcome = h.lifecycle.step().await;
        assert!(matches!(outcome, TickOutcome::Failed(_)));
        assert_eq!(
            h.lifecycle.registration(),
            RegistrationState::Registered { index: 0 }
        );
        assert_eq!(h.state.registration_index(), Some(0));
    }

    #[tokio::test]
    async fn absence_after_registration_unregisters() {
        let mut h = harness(&["a", "me"]);
        h.lifecycle.step().await;
        h.registry.stage(snapshot(&["a"]));
        assert_eq!(h.lifecycle.step().await, TickOutcome::Unregistered);
        assert_eq!(h.lifecycle.registration(), RegistrationState::Unregistered);
        assert_eq!(h.state.registration_index(), None);
    }

    #[test]
    fn cadence_follows_outcome() {
        let cadence = LoopCadence::default();
        assert_eq!(
            cadence.delay_after(&TickOutcome::Unregistered),
            Duration::from_secs(150)
        );
        assert_eq!(
            cadence.delay_after(&TickOutcome::Registered { index: 0 }),
            Duration::from_secs(90)
        );
        assert_eq!(
            cadence.delay_after(&TickOutcome::Failed(LifecycleError::Terminated)),
            Duration::from_secs(90)
        );
        assert!(cadence.reports_on(0));
        assert!(!cadence.reports_on(4));
        assert!(cadence.reports_on(10));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_registered_backs_off_between_checks() {
        let mut h = harness(&["me"]);
        h.registry.fail_next_syncs(2);
        let started = tokio::time::Instant::now();
        assert_eq!(h.lifecycle.wait_until_registered().await, Ok(0));
        assert_eq!(h.registry.sync_count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(240));
        assert!(h.registry.submissions().is_empty());
    }

    #[tokio::test]
    async fn wait_until_registered_yields_to_shutdown() {
        let mut h = harness(&["a"]);
        h.shutdown.trigger(ShutdownReason::OperatorInterrupt);
        assert_eq!(
            h.lifecycle.wait_until_registered().await,
            Err(ShutdownReason::OperatorInterrupt)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_gate_and_terminates() {
        let Harness {
            lifecycle,
            registry,
            gate,
            shutdown,
            ..
        } = harness(&["me"]);
        let bus = Arc::new(MemoryEventBus::new(32));
        let telemetry = NeuronTelemetry::builder("lifecycle")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let mut lifecycle = lifecycle.with_telemetry(Some(telemetry));
        gate.open();
        let handle = tokio::spawn(async move {
            let reason = lifecycle.run().await;
            (reason, lifecycle)
        });
        tokio::time::sleep(Duration::from_secs(200)).await;
        shutdown.trigger(ShutdownReason::OperatorInterrupt);
        let (reason, lifecycle) = handle.await.unwrap();

        assert_eq!(reason, ShutdownReason::OperatorInterrupt);
        assert_eq!(lifecycle.registration(), RegistrationState::Terminated);
        assert!(!gate.is_open());
        assert_eq!(registry.submissions().len(), 1);
        assert_eq!(bus.of_type("lifecycle.terminated").len(), 1);
        assert_eq!(bus.of_type("lifecycle.weights_submitted").len(), 1);
    }

    /// Installs a reordered snapshot right after every sync the loop performs, as
    /// a concurrent worker resync would.
    struct ResyncingRegistry {
        inner: InMemoryRegistry,
        reordered: RegistrySnapshot,
    }

    #[async_trait::async_trait]
    impl RegistryClient for ResyncingRegistry {
        fn latest(&self) -> Option<Arc<RegistrySnapshot>> {
            self.inner.latest()
        }

        async fn sync_snapshot(&self, lite: bool) -> Result<Arc<RegistrySnapshot>, RegistryError> {
            let synced = self.inner.sync_snapshot(lite).await?;
            self.inner.stage(self.reordered.clone());
            self.inner.sync_snapshot(lite).await?;
            Ok(synced)
        }

        async fn submit_weights(&self, uids: &[u16], weights: &[f32]) -> Result<(), RegistryError> {
            self.inner.submit_weights(uids, weights).await
        }
    }

    #[tokio::test]
    async fn report_uses_the_snapshot_the_index_came_from() {
        let registry = Arc::new(ResyncingRegistry {
            inner: InMemoryRegistry::new(snapshot(&["a", "me", "c"])),
            reordered: snapshot(&["me", "a", "c"]),
        });
        let state = NodeState::new();
        let mut lifecycle = LifecycleLoop::new(
            Identity::new("me", "owner"),
            registry.clone(),
            state.clone(),
            ServingGate::new(ConfigCache::new(), state, 8091),
            ShutdownCoordinator::new(
                Arc::new(CountingTerminator::default()),
                Duration::from_secs(10),
            ),
            LoopCadence::default(),
        );

        assert_eq!(
            lifecycle.step().await,
            TickOutcome::Reported { index: 1, step: 0 }
        );
        let latest = registry.latest().unwrap();
        assert_eq!(latest.lookup_index("me"), Some(0));
        let submissions = registry.inner.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].uids, vec![0, 1, 2]);
        assert_eq!(submissions[0].weights, vec![0.0, 1.0, 0.0]);
    }
}
