use std::{path::PathBuf, sync::Arc};

use alchemy_neuron::{
    FileRegistry, Identity, InMemoryRegistry, NeuronRuntime, NeuronTelemetry, NodeKind,
    NodeOptions, RegistryClient, RegistrySnapshot, ShutdownReason,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alchemy_miner", version, about = "Alchemy subnet miner")]
struct Cli {
    /// TOML options file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Subnet the node registers on.
    #[arg(long)]
    netuid: Option<u16>,
    /// Hotkey identifying the neuron in the registry.
    #[arg(long)]
    hotkey: Option<String>,
    /// Coldkey owning the hotkey.
    #[arg(long)]
    coldkey: Option<String>,
    /// Node role; selects the policy blobs.
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    /// Device the pipelines are loaded on, e.g. `cuda:0`.
    #[arg(long)]
    device: Option<String>,
    /// Generation seed; random when unset.
    #[arg(long)]
    seed: Option<u64>,
    /// Classifier-free guidance scale.
    #[arg(long)]
    guidance_scale: Option<f32>,
    /// Inference steps per image.
    #[arg(long)]
    steps: Option<u32>,
    /// Images generated per prompt.
    #[arg(long)]
    num_images: Option<u32>,
    /// Port of the serving boundary.
    #[arg(long)]
    port: Option<u16>,
    /// Experiment tracking project.
    #[arg(long)]
    wandb_project: Option<String>,
    /// Experiment tracking entity.
    #[arg(long)]
    wandb_entity: Option<String>,
    /// Compile the primary pipeline after loading.
    #[arg(long)]
    optimize: bool,
    /// Root of the per-identity working directory.
    #[arg(long)]
    logging_dir: Option<PathBuf>,
    /// JSON snapshot of the registry, re-read on every sync.
    #[arg(long)]
    registry_file: Option<PathBuf>,
    /// Read policy blobs from `<root>/<bucket>/<key>` instead of the public bucket.
    #[arg(long)]
    store_root: Option<PathBuf>,
    /// Structured JSON log file.
    #[arg(long)]
    json_log: Option<PathBuf>,
    /// Minimum level written to the JSON log.
    #[arg(long, value_enum)]
    json_log_level: Option<LevelArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Miner,
    Validator,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for LogLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Debug => Self::Debug,
            LevelArg::Info => Self::Info,
            LevelArg::Warn => Self::Warn,
            LevelArg::Error => Self::Error,
        }
    }
}

impl From<KindArg> for NodeKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Miner => Self::Miner,
            KindArg::Validator => Self::Validator,
        }
    }
}

impl Cli {
    fn options(&self) -> Result<NodeOptions> {
        let mut options = match &self.config {
            Some(path) => NodeOptions::from_toml(
                &std::fs::read_to_string(path)
                    .with_context(|| format!("reading options {}", path.display()))?,
            )
            .with_context(|| format!("parsing options {}", path.display()))?,
            None => NodeOptions::default(),
        };
        if let Some(netuid) = self.netuid {
            options.netuid = netuid;
        }
        if self.hotkey.is_some() || self.coldkey.is_some() {
            options.identity = Identity::new(
                self.hotkey.clone().unwrap_or(options.identity.hotkey),
                self.coldkey.clone().unwrap_or(options.identity.coldkey),
            );
        }
        if let Some(kind) = self.kind {
            options.kind = kind.into();
        }
        if let Some(device) = &self.device {
            options.device.clone_from(device);
        }
        if let Some(seed) = self.seed {
            options.seed = seed;
        }
        if let Some(scale) = self.guidance_scale {
            options.guidance_scale = scale;
        }
        if let Some(steps) = self.steps {
            options.steps = steps;
        }
        if let Some(images) = self.num_images {
            options.num_images = images;
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(project) = &self.wandb_project {
            options.wandb.project.clone_from(project);
        }
        if let Some(entity) = &self.wandb_entity {
            options.wandb.entity.clone_from(entity);
        }
        options.optimize |= self.optimize;
        if let Some(dir) = &self.logging_dir {
            options.logging_dir.clone_from(dir);
        }
        if let Some(root) = &self.store_root {
            options.store.local_root = Some(root.clone());
        }
        if let Some(path) = &self.json_log {
            options.json_log = Some(path.clone());
        }
        if let Some(level) = self.json_log_level {
            options.json_log_level = level.into();
        }
        options.validate()?;
        Ok(options)
    }

    fn registry(&self, options: &NodeOptions) -> Arc<dyn RegistryClient> {
        match &self.registry_file {
            Some(path) => Arc::new(FileRegistry::new(path)),
            None => {
                warn!("no registry file given; using a local single-neuron registry");
                Arc::new(InMemoryRegistry::new(RegistrySnapshot {
                    uids: vec![0],
                    hotkeys: vec![options.identity.hotkey.clone()],
                    ..RegistrySnapshot::default()
                }))
            }
        }
    }
}

fn telemetry(options: &NodeOptions) -> Result<NeuronTelemetry> {
    let events = options.ensure_full_path()?.join("events.jsonl");
    let mut builder = NeuronTelemetry::builder(format!("neuron.{}", options.kind.as_str()))
        .event_publisher(Arc::new(FileEventPublisher::new(&events)?));
    if let Some(path) = &options.json_log {
        builder = builder
            .log_path(path)
            .log_level(options.json_log_level)
            .log_max_bytes(options.json_log_max_bytes);
    }
    builder.build()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let options = cli.options()?;
    info!(
        netuid = options.netuid,
        kind = %options.kind,
        device = %options.device,
        port = options.port,
        "options resolved"
    );

    let telemetry = telemetry(&options).context("initialising telemetry")?;
    telemetry.log(
        LogLevel::Info,
        "neuron.options",
        &json!({ "netuid": options.netuid, "kind": options.kind, "seed": options.seed }),
    )?;
    let registry = cli.registry(&options);
    let runtime = NeuronRuntime::builder(options)
        .registry(registry)
        .telemetry(telemetry)
        .build()?;

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.trigger(ShutdownReason::OperatorInterrupt);
            }
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    let reason = runtime.run().await?;
    info!(%reason, "neuron stopped");
    if reason.exit_code() != 0 {
        std::process::exit(reason.exit_code());
    }
    Ok(())
}
