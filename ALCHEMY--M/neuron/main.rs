use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    background::{
        cleanup::{ArtifactJanitor, CleanupRunner, WandbCleanupRunner},
        BackgroundSchedule, BackgroundSyncWorker,
    },
    lifecycle::{LifecycleLoop, LoopCadence},
    models::{DefaultMiner, NodeVariant},
    options::NodeOptions,
    policy::{BlobKeys, ConfigCache, PolicyLoader},
    registry::RegistryClient,
    serving::ServingGate,
    shutdown::{ProcessTerminator, ShutdownCoordinator, ShutdownReason, Terminator},
    state::NodeState,
    store::{gcs::GcsConfigStore, local::LocalConfigStore, ConfigStore},
    telemetry::NeuronTelemetry,
};

/// Builder wiring capabilities into a [`NeuronRuntime`].
pub struct NeuronRuntimeBuilder {
    options: NodeOptions,
    registry: Option<Arc<dyn RegistryClient>>,
    store: Option<Arc<dyn ConfigStore>>,
    variant: Option<Arc<dyn NodeVariant>>,
    terminator: Option<Arc<dyn Terminator>>,
    cleanup_runner: Option<Arc<dyn CleanupRunner>>,
    telemetry: Option<NeuronTelemetry>,
}

impl NeuronRuntimeBuilder {
    /// Starts a builder for `options`.
    #[must_use]
    pub fn new(options: NodeOptions) -> Self {
        Self {
            options,
            registry: None,
            store: None,
            variant: None,
            terminator: None,
            cleanup_runner: None,
            telemetry: None,
        }
    }

    /// Registry client; required.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Policy store; defaults to the local root or the public endpoint.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Node variant; defaults to [`DefaultMiner`].
    #[must_use]
    pub fn variant(mut self, variant: Arc<dyn NodeVariant>) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Emergency terminator; defaults to [`ProcessTerminator`].
    #[must_use]
    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Cleanup command runner; defaults to [`WandbCleanupRunner`].
    #[must_use]
    pub fn cleanup_runner(mut self, runner: Arc<dyn CleanupRunner>) -> Self {
        self.cleanup_runner = Some(runner);
        self
    }

    /// Telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: NeuronTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates options and builds the runtime.
    ///
    /// # Errors
    /// Fails on invalid options, a missing registry or an unusable store endpoint.
    pub fn build(self) -> Result<NeuronRuntime> {
        self.options.validate()?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow!("a registry client is required"))?;
        let store = match self.store {
            Some(store) => store,
            None => match &self.options.store.local_root {
                Some(root) => Arc::new(LocalConfigStore::new(root)) as Arc<dyn ConfigStore>,
                None => Arc::new(GcsConfigStore::new(
                    &self.options.store.endpoint,
                    GcsConfigStore::DEFAULT_TIMEOUT,
                )?),
            },
        };
        let variant = self
            .variant
            .unwrap_or_else(|| Arc::new(DefaultMiner::new()));
        if variant.kind() != self.options.kind {
            warn!(
                variant = %variant.kind(),
                configured = %self.options.kind,
                "node variant does not match the configured kind"
            );
        }
        let terminator = self
            .terminator
            .unwrap_or_else(|| Arc::new(ProcessTerminator));
        let cleanup_runner = self
            .cleanup_runner
            .unwrap_or_else(|| Arc::new(WandbCleanupRunner::default()));

        let state = NodeState::new();
        let cache = ConfigCache::new();
        let shutdown = ShutdownCoordinator::new(terminator, self.options.termination_grace());
        let gate = ServingGate::new(cache.clone(), state.clone(), self.options.port);
        Ok(NeuronRuntime {
            options: self.options,
            registry,
            store,
            variant,
            cleanup_runner,
            telemetry: self.telemetry,
            state,
            cache,
            shutdown,
            gate,
        })
    }
}

/// Lifecycle manager: registration loop, background worker and serving gate.
pub struct NeuronRuntime {
    options: NodeOptions,
    registry: Arc<dyn RegistryClient>,
    store: Arc<dyn ConfigStore>,
    variant: Arc<dyn NodeVariant>,
    cleanup_runner: Arc<dyn CleanupRunner>,
    telemetry: Option<NeuronTelemetry>,
    state: NodeState,
    cache: ConfigCache,
    shutdown: ShutdownCoordinator,
    gate: ServingGate,
}

impl std::fmt::Debug for NeuronRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuronRuntime")
            .field("netuid", &self.options.netuid)
            .field("kind", &self.options.kind)
            .field("hotkey", &self.options.identity.hotkey)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl NeuronRuntime {
    /// Returns a builder.
    #[must_use]
    pub fn builder(options: NodeOptions) -> NeuronRuntimeBuilder {
        NeuronRuntimeBuilder::new(options)
    }

    /// Handle used to request shutdown from outside, e.g. a signal handler.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Shared node state.
    #[must_use]
    pub const fn state(&self) -> &NodeState {
        &self.state
    }

    /// Current policy cache.
    #[must_use]
    pub const fn cache(&self) -> &ConfigCache {
        &self.cache
    }

    /// Serving boundary.
    #[must_use]
    pub const fn gate(&self) -> &ServingGate {
        &self.gate
    }

    /// Options the runtime was built with.
    #[must_use]
    pub const fn options(&self) -> &NodeOptions {
        &self.options
    }

    /// Runs until shutdown and returns its reason.
    ///
    /// Start-up order: working directory, registration, models, serving gate, then
    /// the background worker alongside the lifecycle loop.
    ///
    /// # Errors
    /// Fails when the working directory cannot be created or models fail to load.
    pub async fn run(&self) -> Result<ShutdownReason> {
        let full_path = self.options.ensure_full_path()?;
        info!(
            netuid = self.options.netuid,
            kind = %self.options.kind,
            hotkey = %self.options.identity.hotkey,
            path = %full_path.display(),
            "starting neuron"
        );

        let mut lifecycle = LifecycleLoop::new(
            self.options.identity.clone(),
            Arc::clone(&self.registry),
            self.state.clone(),
            self.gate.clone(),
            self.shutdown.clone(),
            LoopCadence::from_timing(&self.options.timing),
        )
        .with_telemetry(self.telemetry.clone());

        let index = match lifecycle.wait_until_registered().await {
            Ok(index) => index,
            Err(reason) => {
                info!(%reason, "stopped before registration");
                return Ok(reason);
            }
        };

        let mut models = self
            .variant
            .load_models(&self.options.generation_args())
            .await
            .context("loading models")?;
        if self.options.optimize {
            if let Err(err) = models.optimize() {
                warn!(error = %err, "model optimization failed; serving unoptimized");
            }
        }

        self.gate.open();
        self.emit(
            LogLevel::Info,
            "runtime.serving",
            json!({ "index": index, "port": self.gate.port(), "model": models.primary.name() }),
        )
        .await;

        let worker = tokio::spawn(self.worker().run());
        let reason = lifecycle.run().await;
        self.finish(reason, worker).await;
        drop(models);
        Ok(reason)
    }

    fn worker(&self) -> BackgroundSyncWorker {
        let keys = BlobKeys::for_kind(self.options.kind, &self.options.store.bucket);
        let janitor = ArtifactJanitor::new(
            &self.options.wandb.artifacts_dir,
            Arc::clone(&self.cleanup_runner),
        );
        BackgroundSyncWorker::new(
            self.options.identity.clone(),
            Arc::clone(&self.registry),
            PolicyLoader::new(Arc::clone(&self.store), keys),
            self.cache.clone(),
            self.state.clone(),
            self.shutdown.clone(),
        )
        .with_janitor(janitor)
        .with_schedule(BackgroundSchedule::from_timing(&self.options.timing))
        .with_telemetry(self.telemetry.clone())
    }

    async fn finish(&self, reason: ShutdownReason, worker: JoinHandle<ShutdownReason>) {
        self.shutdown.trigger(reason);
        self.gate.stop();
        // the worker's emergency path sleeps one grace period before terminating
        let wait = match reason {
            ShutdownReason::OperatorInterrupt => self.shutdown.grace(),
            ShutdownReason::Deregistered => self.shutdown.grace() * 2 + Duration::from_secs(1),
        };
        match timeout(wait, worker).await {
            Ok(Ok(worker_reason)) => debug!(%worker_reason, "background worker stopped"),
            Ok(Err(err)) => warn!(error = %err, "background worker panicked"),
            Err(_) => warn!(wait_secs = wait.as_secs(), "background worker did not stop in time"),
        }
        if reason == ShutdownReason::Deregistered {
            self.shutdown.terminate_now(reason);
        }
        self.emit(
            LogLevel::Info,
            "runtime.stopped",
            json!({ "reason": reason, "stats": self.state.stats() }),
        )
        .await;
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
        background::cleanup::RecordingRunner,
        options::{Identity, NodeKind},
        policy::tests::seeded_store,
        registry::{memory::InMemoryRegistry, RegistrySnapshot},
        shutdown::CountingTerminator,
    };
    use shared_event_bus::MemoryEventBus;
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    fn snapshot(hotkeys: &[&str]) -> RegistrySnapshot {
        RegistrySnapshot {
            block: 9,
            uids: (0..hotkeys.len() as u16).collect(),
            hotkeys: hotkeys.iter().map(|h| (*h).to_string()).collect(),
            ..RegistrySnapshot::default()
        }
    }

    struct Fixture {
        runtime: NeuronRuntime,
        registry: Arc<InMemoryRegistry>,
        terminator: Arc<CountingTerminator>,
        bus: Arc<MemoryEventBus>,
        tmp: TempDir,
    }

    fn fixture(hotkeys: &[&str]) -> Fixture {
        let tmp = tempdir().unwrap();
        let options = NodeOptions {
            identity: Identity::new("me", "owner"),
            logging_dir: tmp.path().join("logs"),
            optimize: true,
            ..NodeOptions::default()
        };
        let keys = BlobKeys::for_kind(NodeKind::Miner, &options.store.bucket);
        let registry = Arc::new(InMemoryRegistry::new(snapshot(hotkeys)));
        let terminator = Arc::new(CountingTerminator::default());
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = NeuronTelemetry::builder("neuron")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let runtime = NeuronRuntime::builder(options)
            .registry(registry.clone())
            .store(seeded_store(&keys))
            .terminator(terminator.clone())
            .cleanup_runner(Arc::new(RecordingRunner::default()))
            .telemetry(telemetry)
            .build()
            .unwrap();
        Fixture {
            runtime,
            registry,
            terminator,
            bus,
            tmp,
        }
    }

    #[test]
    fn build_requires_registry() {
        let options = NodeOptions {
            identity: Identity::new("me", "owner"),
            ..NodeOptions::default()
        };
        let err = NeuronRuntime::builder(options).build().unwrap_err();
        assert!(err.to_string().contains("registry"));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_interrupt_shuts_down_gracefully() {
        let Fixture {
            runtime,
            registry,
            terminator,
            bus,
            tmp,
        } = fixture(&["other", "me"]);
        let runtime = Arc::new(runtime);
        let shutdown = runtime.shutdown_handle();
        let handle = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.run().await })
        };
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(runtime.gate().is_open());
        assert_eq!(runtime.state().registration_index(), Some(1));
        assert!(runtime.cache().read().generation >= 1);

        shutdown.trigger(ShutdownReason::OperatorInterrupt);
        let reason = handle.await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::OperatorInterrupt);
        assert!(!runtime.gate().is_open());
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.submissions()[0].weights, vec![0.0, 1.0]);
        assert!(tmp.path().join("logs/me/netuid1/miner").is_dir());
        assert_eq!(bus.of_type("runtime.stopped").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deregistration_terminates_once() {
        let Fixture {
            runtime,
            registry,
            terminator,
            tmp: _tmp,
            ..
        } = fixture(&["me"]);
        let runtime = Arc::new(runtime);
        let handle = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.run().await })
        };
        tokio::time::sleep(Duration::from_secs(100)).await;
        registry.stage(snapshot(&["someone-else"]));
        let reason = handle.await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Deregistered);
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
        assert!(!runtime.gate().is_open());
    }

    #[tokio::test]
    async fn shutdown_before_registration_skips_serving() {
        let Fixture {
            runtime, tmp: _tmp, ..
        } = fixture(&["other"]);
        runtime
            .shutdown_handle()
            .trigger(ShutdownReason::OperatorInterrupt);
        let reason = runtime.run().await.unwrap();
        assert_eq!(reason, ShutdownReason::OperatorInterrupt);
        assert!(!runtime.gate().is_open());
    }
}
