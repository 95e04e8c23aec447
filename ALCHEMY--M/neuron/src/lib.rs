#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Alchemy neuron lifecycle manager: keeps a node registered, asserts its
//! self-weight to the registry, and keeps policy parameters in sync.

/// Resolved node options and generation arguments.
#[path = "../options.rs"]
pub mod options;

/// Shared registration index and request statistics.
#[path = "../state.rs"]
pub mod state;

/// Policy snapshot cache and blob parsing.
#[path = "../policy/main.rs"]
pub mod policy;

/// Registry capability and snapshot types.
#[path = "../registry/main.rs"]
pub mod registry;

/// Configuration store capability.
#[path = "../store/main.rs"]
pub mod store;

/// Cooperative and emergency shutdown.
#[path = "../shutdown.rs"]
pub mod shutdown;

/// Background policy sync and membership watchdog.
#[path = "../background/main.rs"]
pub mod background;

/// Main registration and weight-submission loop.
#[path = "../lifecycle/main.rs"]
pub mod lifecycle;

/// Request admission at the serving boundary.
#[path = "../serving.rs"]
pub mod serving;

/// Model-loading capability implemented by node variants.
#[path = "../models.rs"]
pub mod models;

/// Telemetry builder for neuron components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Runtime wiring every component together.
#[path = "../main.rs"]
pub mod runtime;

pub use background::{
    cleanup::{ArtifactJanitor, CleanupError, CleanupOutcome, CleanupRunner, WandbCleanupRunner},
    BackgroundSchedule, BackgroundSyncWorker, CleanupDispatch, MembershipCheck, PolicyRefresh,
    TaskSchedule, WorkerTickReport,
};
pub use lifecycle::{
    weights::{self_weight_vector, TelemetryLine},
    LifecycleError, LifecycleLoop, LoopCadence, RegistrationState, TickOutcome,
};
pub use models::{DefaultMiner, ModelPair, NamedPipeline, NodeVariant, Pipeline};
pub use options::{GenerationArgs, Identity, NodeKind, NodeOptions, OptionsError};
pub use policy::{
    blobs::{parse_reward_weights, AccessList, KeyType, SettingsBlob},
    BlobKeys, ConfigCache, PolicyError, PolicyLoader, PolicySnapshot,
};
pub use registry::{
    file::FileRegistry,
    memory::{InMemoryRegistry, WeightSubmission},
    NeuronMetrics, RegistryClient, RegistryError, RegistrySnapshot, SnapshotView,
};
pub use runtime::{NeuronRuntime, NeuronRuntimeBuilder};
pub use serving::{Admission, Caller, ServingGate};
pub use shutdown::{
    ProcessTerminator, ShutdownCoordinator, ShutdownReason, Terminator, EXIT_DEREGISTERED,
};
pub use state::{NodeState, NodeStats};
pub use store::{
    gcs::GcsConfigStore, local::LocalConfigStore, memory::InMemoryConfigStore, ConfigStore,
    StoreError,
};
pub use telemetry::{NeuronTelemetry, NeuronTelemetryBuilder};
